//! Flat, renamed tool identity exposed upstream.

use rmcp::model::Tool as RmcpTool;

/// A tool as discovered on a downstream server, tagged with the server that owns it.
///
/// The `control_name` (`"{owner_server_name}-{original_name}"`) is the only identifier
/// ever exposed to upstream clients; it must be unique across the whole registry.
#[derive(Debug, Clone)]
pub struct DownstreamTool {
    pub owner_server_name: String,
    pub original_name: String,
    pub description: Option<String>,
    pub schema: RmcpTool,
}

impl DownstreamTool {
    pub fn from_rmcp(owner_server_name: impl Into<String>, tool: RmcpTool) -> Self {
        let owner_server_name = owner_server_name.into();
        let original_name = tool.name.to_string();
        let description = tool.description.as_ref().map(|d| d.to_string());
        Self {
            owner_server_name,
            original_name,
            description,
            schema: tool,
        }
    }

    /// `"{owner_server_name}-{original_name}"` — the globally unique exposed identifier.
    pub fn control_name(&self) -> String {
        format_control_name(&self.owner_server_name, &self.original_name)
    }

    /// The tool as it should appear to upstream clients: same schema and description,
    /// renamed to its control name.
    pub fn renamed(&self) -> RmcpTool {
        let mut exposed = self.schema.clone();
        exposed.name = self.control_name().into();
        exposed
    }
}

pub fn format_control_name(server_name: &str, original_name: &str) -> String {
    format!("{server_name}-{original_name}")
}

/// A server name or tool name containing the control-name separator would make
/// `control_name` ambiguous to split back apart. Not enforced by the registry itself
/// (control names are never split, only constructed and compared), but surfaced here
/// so callers validating new server specs can reject it up front.
pub fn contains_reserved_separator(s: &str) -> bool {
    s.contains('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_name_joins_with_hyphen() {
        assert_eq!(format_control_name("brave", "web_search"), "brave-web_search");
    }
}
