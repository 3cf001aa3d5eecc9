//! The authorization/visibility projection from the downstream universe into a
//! named, curated view. Pure in-memory state; no I/O.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named, curated subset of the downstream tool universe.
///
/// `assigned_servers` empty means no assignment filter has ever been applied:
/// every server known to `servers_enabled` is visible, matching the legacy
/// whole-registry view used by kits that predate per-server assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kit {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub assigned_servers: Vec<String>,
    #[serde(default)]
    pub servers_enabled: HashMap<String, bool>,
    #[serde(default)]
    pub tools_enabled: HashMap<String, bool>,
    #[serde(default)]
    pub hierarchy: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub tool_to_server: HashMap<String, String>,
}

impl Kit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            assigned_servers: Vec::new(),
            servers_enabled: HashMap::new(),
            tools_enabled: HashMap::new(),
            hierarchy: HashMap::new(),
            tool_to_server: HashMap::new(),
        }
    }

    pub fn enable_kit(&mut self) {
        self.enabled = true;
    }

    pub fn disable_kit(&mut self) {
        self.enabled = false;
    }

    pub fn enable_server(&mut self, server_name: &str) {
        self.servers_enabled.insert(server_name.to_string(), true);
    }

    pub fn disable_server(&mut self, server_name: &str) {
        self.servers_enabled.insert(server_name.to_string(), false);
    }

    pub fn enable_tool(&mut self, control_name: &str) {
        self.tools_enabled.insert(control_name.to_string(), true);
    }

    pub fn disable_tool(&mut self, control_name: &str) {
        self.tools_enabled.insert(control_name.to_string(), false);
    }

    /// Appends `server_name` to `assigned_servers` if absent and enables it.
    /// Tool entries are populated separately by the Composer, which alone knows
    /// the registry's current tool list for that server.
    pub fn assign(&mut self, server_name: &str) {
        if !self.assigned_servers.iter().any(|s| s == server_name) {
            self.assigned_servers.push(server_name.to_string());
        }
        self.servers_enabled.insert(server_name.to_string(), true);
    }

    /// Removes `server_name` and every tool entry it owns. Idempotent.
    pub fn unassign(&mut self, server_name: &str) {
        self.assigned_servers.retain(|s| s != server_name);
        self.servers_enabled.remove(server_name);
        self.tools_enabled
            .retain(|t, _| self.tool_to_server.get(t).map(String::as_str) != Some(server_name));
        self.tool_to_server
            .retain(|_, s| s != server_name);
        self.hierarchy.remove(server_name);
    }

    pub fn is_server_assigned(&self, server_name: &str) -> bool {
        self.assigned_servers.iter().any(|s| s == server_name)
    }

    /// Every control name that is enabled, whose owning server is enabled, and
    /// that survives the assignment filter (a no-op when `assigned_servers` is
    /// empty). The kit's own top-level `enabled` flag is deliberately not
    /// consulted here; the Gateway checks it separately.
    pub fn list_enabled_tool_control_names(&self) -> Vec<String> {
        self.tools_enabled
            .iter()
            .filter(|(_, &enabled)| enabled)
            .filter_map(|(tool, _)| {
                let server = self.tool_to_server.get(tool)?;
                if !self.servers_enabled.get(server).copied().unwrap_or(false) {
                    return None;
                }
                if !self.assigned_servers.is_empty() && !self.is_server_assigned(server) {
                    return None;
                }
                Some(tool.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_kit() -> Kit {
        let mut kit = Kit::new("K");
        kit.servers_enabled.insert("A".to_string(), true);
        kit.servers_enabled.insert("B".to_string(), true);
        kit.hierarchy
            .insert("A".to_string(), vec!["A-t1".to_string(), "A-t2".to_string()]);
        kit.hierarchy.insert("B".to_string(), vec!["B-t1".to_string()]);
        for (t, s) in [("A-t1", "A"), ("A-t2", "A"), ("B-t1", "B")] {
            kit.tools_enabled.insert(t.to_string(), true);
            kit.tool_to_server.insert(t.to_string(), s.to_string());
        }
        kit
    }

    #[test]
    fn empty_assigned_servers_behaves_as_legacy_whole_registry_view() {
        let kit = seeded_kit();
        let mut visible = kit.list_enabled_tool_control_names();
        visible.sort();
        assert_eq!(visible, vec!["A-t1", "A-t2", "B-t1"]);
    }

    #[test]
    fn assignment_filters_visibility() {
        let mut kit = seeded_kit();
        kit.assign("A");
        let mut visible = kit.list_enabled_tool_control_names();
        visible.sort();
        assert_eq!(visible, vec!["A-t1", "A-t2"]);
    }

    #[test]
    fn disabling_server_cascades_to_its_tools() {
        let mut kit = seeded_kit();
        kit.disable_server("A");
        assert_eq!(kit.list_enabled_tool_control_names(), vec!["B-t1"]);
    }

    #[test]
    fn unassign_removes_server_and_its_tool_entries() {
        let mut kit = seeded_kit();
        kit.assign("A");
        kit.unassign("A");
        assert!(!kit.is_server_assigned("A"));
        assert!(!kit.tools_enabled.contains_key("A-t1"));
        assert!(!kit.tools_enabled.contains_key("A-t2"));
        assert!(!kit.hierarchy.contains_key("A"));
    }

    #[test]
    fn unassign_is_idempotent() {
        let mut kit = seeded_kit();
        kit.unassign("A");
        kit.unassign("A");
        assert!(!kit.is_server_assigned("A"));
    }

    #[test]
    fn assign_then_unassign_restores_state_restricted_to_other_keys() {
        let before = seeded_kit();
        let mut kit = before.clone();
        kit.assign("A");
        kit.unassign("A");
        assert_eq!(kit.servers_enabled.get("B"), before.servers_enabled.get("B"));
        assert_eq!(kit.tools_enabled.get("B-t1"), before.tools_enabled.get("B-t1"));
    }
}
