//! Construction parameters of a [`NodeSession`][crate::NodeSession].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Availability timeout used by `call_service` and `send_action_goal` when
/// the caller does not pass one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Identity and dispatch cadence of the session's node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Node name (e.g. `"nodekit_node"`).
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Node namespace; `"/"` is the root namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Period of the dispatch loop that delivers queued callbacks.
    #[serde(default = "default_spin_interval_ms")]
    pub spin_interval_ms: u64,
}

fn default_node_name() -> String {
    "nodekit_node".to_string()
}
fn default_namespace() -> String {
    "/".to_string()
}
fn default_spin_interval_ms() -> u64 {
    100
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            namespace: default_namespace(),
            spin_interval_ms: default_spin_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Dispatch period, never shorter than one millisecond.
    pub fn spin_interval(&self) -> Duration {
        Duration::from_millis(self.spin_interval_ms.max(1))
    }

    /// `namespace/name` with exactly one separating slash, e.g.
    /// `/robot1/gui`.
    pub fn fully_qualified_name(&self) -> String {
        let namespace = self.namespace.trim_end_matches('/');
        if namespace.is_empty() {
            format!("/{}", self.node_name)
        } else if namespace.starts_with('/') {
            format!("{namespace}/{}", self.node_name)
        } else {
            format!("/{namespace}/{}", self.node_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.node_name, "nodekit_node");
        assert_eq!(cfg.namespace, "/");
        assert_eq!(cfg.spin_interval(), Duration::from_millis(100));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: SessionConfig = serde_json::from_str(r#"{ "node_name": "gui" }"#).unwrap();
        assert_eq!(cfg.node_name, "gui");
        assert_eq!(cfg.namespace, "/");
        assert_eq!(cfg.spin_interval_ms, 100);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = SessionConfig::default().with_spin_interval(Duration::ZERO);
        assert_eq!(cfg.spin_interval(), Duration::from_millis(1));
    }

    #[test]
    fn oversized_interval_saturates() {
        let cfg = SessionConfig::default().with_spin_interval(Duration::MAX);
        assert_eq!(cfg.spin_interval_ms, u64::MAX);
    }

    #[test]
    fn fully_qualified_name_joins_namespace() {
        let root = SessionConfig::default().with_node_name("gui");
        assert_eq!(root.fully_qualified_name(), "/gui");

        let nested = root.clone().with_namespace("/robot1/");
        assert_eq!(nested.fully_qualified_name(), "/robot1/gui");

        let relative = root.with_namespace("robot2");
        assert_eq!(relative.fully_qualified_name(), "/robot2/gui");
    }
}
