//! Immutable descriptions of downstream MCP servers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How to reach a downstream tool server. Exactly one variant per server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownstreamTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
    },
}

/// Unique, immutable description of a downstream server. Never mutated in place;
/// re-registering under the same name requires going through the registry's
/// remove-then-add path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamServerSpec {
    pub name: String,
    #[serde(flatten)]
    pub transport: DownstreamTransport,
}

impl DownstreamServerSpec {
    pub fn stdio(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: DownstreamTransport::Stdio {
                command: command.into(),
                args,
                env,
            },
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: DownstreamTransport::Sse { url: url.into() },
        }
    }
}
