//! Command allowlisting for connected nodes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::NodeSession;

/// Decides whether a node may execute a command.
///
/// A command is allowed iff the node declares it and the gateway's
/// allowlist for that node contains it. `per_node` entries override the
/// default list wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandPolicy {
    /// Allowlist applied to nodes without a per-node entry.
    pub default_allow: Vec<String>,
    /// Per-node allowlists, keyed by node id.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub per_node: HashMap<String, Vec<String>>,
}

impl CommandPolicy {
    /// A policy allowing `commands` on every node that declares them.
    pub fn allowing<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default_allow: commands.into_iter().map(Into::into).collect(),
            per_node: HashMap::new(),
        }
    }

    /// Whether `session` may execute `command`.
    pub fn allows(&self, command: &str, session: &NodeSession) -> bool {
        if !session.declared_commands.iter().any(|c| c == command) {
            return false;
        }
        let list = self
            .per_node
            .get(&session.node_id)
            .unwrap_or(&self.default_allow);
        list.iter().any(|c| c == command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeResources;

    fn session(node_id: &str, declared: &[&str]) -> NodeSession {
        NodeSession {
            node_id: node_id.to_string(),
            conn_id: format!("{node_id}-conn"),
            declared_commands: declared.iter().map(|s| s.to_string()).collect(),
            caps: Vec::new(),
            resources: NodeResources::default(),
            connected_at_ms: 0,
        }
    }

    #[test]
    fn allow_is_the_intersection_of_declared_and_allowlist() {
        let policy = CommandPolicy::allowing(["system.run"]);

        assert!(policy.allows("system.run", &session("n1", &["system.run"])));
        // Declared but not allowlisted.
        assert!(!policy.allows("system.reboot", &session("n1", &["system.reboot"])));
        // Allowlisted but not declared.
        assert!(!policy.allows("system.run", &session("n1", &["system.info"])));
    }

    #[test]
    fn per_node_entry_overrides_the_default_list() {
        let mut policy = CommandPolicy::allowing(["system.run"]);
        policy
            .per_node
            .insert("restricted".to_string(), Vec::new());

        assert!(policy.allows("system.run", &session("open", &["system.run"])));
        assert!(!policy.allows("system.run", &session("restricted", &["system.run"])));
    }
}
