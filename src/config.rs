//! Durable, crash-safe JSON persistence for downstream server definitions and
//! kit assignments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use composer_registry::{DownstreamServerSpec, DownstreamTransport};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ComposerError, ComposerResult};
use crate::kit::Kit;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoredServer {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoredKitAssignment {
    #[serde(default)]
    pub assigned_servers: Vec<String>,
    #[serde(default)]
    pub servers_enabled: HashMap<String, bool>,
    #[serde(default)]
    pub tools_enabled: HashMap<String, bool>,
    #[serde(default)]
    pub servers_tools_hierarchy_map: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub tools_servers_map: HashMap<String, String>,
}

/// The on-disk document. Both top-level keys are always present after any
/// successful `save`, even if empty.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigurationDocument {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, StoredServer>,
    #[serde(default, rename = "serverKitAssignments")]
    pub server_kit_assignments: HashMap<String, StoredKitAssignment>,
}

impl ConfigurationDocument {
    /// Server specs for every entry that names at least a command or a URL.
    /// An entry missing both is skipped with a warning, per the load-time contract.
    pub fn server_specs(&self) -> Vec<DownstreamServerSpec> {
        self.mcp_servers
            .iter()
            .filter_map(|(name, stored)| match (&stored.command, &stored.url) {
                (Some(command), _) => Some(DownstreamServerSpec::stdio(
                    name.clone(),
                    command.clone(),
                    stored.args.clone(),
                    stored.env.clone(),
                )),
                (None, Some(url)) => Some(DownstreamServerSpec::sse(name.clone(), url.clone())),
                (None, None) => {
                    warn!(server = %name, "config entry has neither 'command' nor 'url', skipping");
                    None
                }
            })
            .collect()
    }
}

/// Atomic read/write of the configuration document, serialized through a
/// single mutation lock so no partial mid-flight state is visible to readers
/// within this process.
pub struct ConfigurationManager {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigurationManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> ComposerResult<ConfigurationDocument> {
        let _guard = self.lock.lock().await;
        Self::read(&self.path).await
    }

    async fn read(path: &Path) -> ComposerResult<ConfigurationDocument> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "configuration file not found, using empty document");
                return Ok(ConfigurationDocument::default());
            }
            Err(e) => return Err(ComposerError::PersistenceError(e.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| ComposerError::CorruptConfig(format!("{}: {e}", path.display())))
    }

    /// Writes `doc` using rename-backup-then-write: if the target exists it is
    /// renamed to `<path>.bak` first; on any write failure the backup is
    /// renamed back, leaving the file exactly as it was before the call.
    pub async fn save(&self, doc: &ConfigurationDocument) -> ComposerResult<()> {
        let _guard = self.lock.lock().await;
        let backup_path = Self::backup_path(&self.path);

        let had_existing = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| ComposerError::PersistenceError(e.to_string()))?;
        if had_existing {
            tokio::fs::rename(&self.path, &backup_path)
                .await
                .map_err(|e| ComposerError::PersistenceError(e.to_string()))?;
        }

        let body = serde_json::to_vec_pretty(doc)
            .map_err(|e| ComposerError::PersistenceError(e.to_string()))?;

        match tokio::fs::write(&self.path, body).await {
            Ok(()) => {
                info!(path = %self.path.display(), "configuration saved");
                Ok(())
            }
            Err(e) => {
                if had_existing {
                    if let Err(restore_err) = tokio::fs::rename(&backup_path, &self.path).await {
                        warn!(error = %restore_err, "failed to restore configuration backup after write failure");
                    } else {
                        info!("restored configuration from backup after write failure");
                    }
                }
                Err(ComposerError::PersistenceError(e.to_string()))
            }
        }
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        PathBuf::from(backup)
    }

    pub async fn add_mcp_server(&self, spec: &DownstreamServerSpec) -> ComposerResult<()> {
        let mut doc = self.load().await?;
        if doc.mcp_servers.contains_key(&spec.name) {
            return Err(ComposerError::Conflict(format!(
                "MCP server '{}' already exists in configuration",
                spec.name
            )));
        }
        let stored = match &spec.transport {
            DownstreamTransport::Stdio { command, args, env } => StoredServer {
                command: Some(command.clone()),
                args: args.clone(),
                env: env.clone(),
                url: None,
            },
            DownstreamTransport::Sse { url } => StoredServer {
                url: Some(url.clone()),
                ..Default::default()
            },
        };
        doc.mcp_servers.insert(spec.name.clone(), stored);
        self.save(&doc).await
    }

    /// Drops `name` from every kit's `assigned_servers`/`servers_enabled`, and
    /// every `tools_enabled` entry prefixed `"{name}-"`. Does not prune
    /// `servers_tools_hierarchy_map`/`tools_servers_map`; those are rebuilt by
    /// `migrate_kits` from the live registry at next startup.
    pub async fn remove_mcp_server(&self, name: &str) -> ComposerResult<()> {
        let mut doc = self.load().await?;
        if doc.mcp_servers.remove(name).is_none() {
            return Err(ComposerError::NotFound(format!(
                "MCP server '{name}' not found in configuration"
            )));
        }
        let prefix = format!("{name}-");
        for assignment in doc.server_kit_assignments.values_mut() {
            assignment.assigned_servers.retain(|s| s != name);
            assignment.servers_enabled.remove(name);
            assignment
                .tools_enabled
                .retain(|tool, _| !tool.starts_with(&prefix));
        }
        self.save(&doc).await
    }

    pub async fn update_kit_assignments(&self, kit: &Kit) -> ComposerResult<()> {
        let mut doc = self.load().await?;
        doc.server_kit_assignments.insert(
            kit.name.clone(),
            StoredKitAssignment {
                assigned_servers: kit.assigned_servers.clone(),
                servers_enabled: kit.servers_enabled.clone(),
                tools_enabled: kit.tools_enabled.clone(),
                servers_tools_hierarchy_map: kit.hierarchy.clone(),
                tools_servers_map: kit.tool_to_server.clone(),
            },
        );
        self.save(&doc).await
    }

    pub async fn load_kit_assignments(
        &self,
    ) -> ComposerResult<HashMap<String, StoredKitAssignment>> {
        Ok(self.load().await?.server_kit_assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path() -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        dir.keep().join("config.json")
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty_document_with_both_keys() {
        let manager = ConfigurationManager::new(tmp_path());
        let doc = manager.load().await.unwrap();
        assert!(doc.mcp_servers.is_empty());
        assert!(doc.server_kit_assignments.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let manager = ConfigurationManager::new(tmp_path());
        let mut doc = ConfigurationDocument::default();
        doc.mcp_servers.insert(
            "A".to_string(),
            StoredServer {
                command: Some("echo".to_string()),
                args: vec!["x".to_string()],
                ..Default::default()
            },
        );
        manager.save(&doc).await.unwrap();
        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.mcp_servers["A"].command.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn add_mcp_server_rejects_duplicate() {
        let path = tmp_path();
        let manager = ConfigurationManager::new(path);
        let spec = DownstreamServerSpec::stdio("A", "echo", vec![], Default::default());
        manager.add_mcp_server(&spec).await.unwrap();
        let err = manager.add_mcp_server(&spec).await.unwrap_err();
        assert!(matches!(err, ComposerError::Conflict(_)));
    }

    #[tokio::test]
    async fn remove_mcp_server_prunes_kit_assignments() {
        let path = tmp_path();
        let manager = ConfigurationManager::new(path);
        let spec = DownstreamServerSpec::stdio("A", "echo", vec![], Default::default());
        manager.add_mcp_server(&spec).await.unwrap();

        let mut kit = Kit::new("K");
        kit.assign("A");
        kit.enable_tool("A-t1");
        kit.tool_to_server.insert("A-t1".to_string(), "A".to_string());
        manager.update_kit_assignments(&kit).await.unwrap();

        manager.remove_mcp_server("A").await.unwrap();
        let assignments = manager.load_kit_assignments().await.unwrap();
        let k = &assignments["K"];
        assert!(k.assigned_servers.is_empty());
        assert!(!k.servers_enabled.contains_key("A"));
        assert!(!k.tools_enabled.contains_key("A-t1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_failure_leaves_no_partial_state() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let manager = ConfigurationManager::new(&path);

        // No pre-existing file, so `save` skips the backup rename and goes
        // straight to the write; making the directory read-only fails that
        // write outright, and nothing should appear at `path`.
        let original_perms = tokio::fs::metadata(dir.path()).await.unwrap().permissions();
        let mut readonly = original_perms.clone();
        readonly.set_mode(0o555);
        tokio::fs::set_permissions(dir.path(), readonly).await.unwrap();

        let doc = ConfigurationDocument::default();
        let result = manager.save(&doc).await;

        tokio::fs::set_permissions(dir.path(), original_perms)
            .await
            .unwrap();

        assert!(result.is_err());
        assert!(!tokio::fs::try_exists(&path).await.unwrap());
    }
}
