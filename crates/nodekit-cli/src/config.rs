//! Configuration file – reads/writes `~/.nodekit/config.toml`.

use nodekit_middleware::DEFAULT_ROSBRIDGE_URL;
use nodekit_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which middleware the shell's session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process graph with demo servers; needs no robot.
    #[default]
    Loopback,
    /// A rosbridge WebSocket server.
    Rosbridge,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Loopback => write!(f, "loopback"),
            Backend::Rosbridge => write!(f, "rosbridge"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "loopback" => Ok(Backend::Loopback),
            "rosbridge" => Ok(Backend::Rosbridge),
            other => Err(format!("unknown backend '{other}' (expected loopback or rosbridge)")),
        }
    }
}

/// Persisted user configuration stored in `~/.nodekit/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,

    /// WebSocket URL of the rosbridge server (used by the rosbridge backend).
    #[serde(default = "default_rosbridge_url")]
    pub rosbridge_url: String,

    /// Identity and dispatch cadence of the shell's node (`[session]` table).
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_rosbridge_url() -> String {
    DEFAULT_ROSBRIDGE_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            rosbridge_url: default_rosbridge_url(),
            session: SessionConfig::default(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// Return the path to `~/.nodekit/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".nodekit").join("config.toml")
}

/// Return the path to the shell's line history, `~/.nodekit/history`.
pub fn history_path() -> PathBuf {
    PathBuf::from(home_dir()).join(".nodekit").join("history")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `NODEKIT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `NODEKIT_BACKEND` | `backend` |
/// | `NODEKIT_ROSBRIDGE_URL` | `rosbridge_url` |
/// | `NODEKIT_NODE_NAME` | `session.node_name` |
/// | `NODEKIT_NAMESPACE` | `session.namespace` |
/// | `NODEKIT_SPIN_INTERVAL_MS` | `session.spin_interval_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("NODEKIT_BACKEND")
        && let Ok(backend) = v.parse::<Backend>()
    {
        cfg.backend = backend;
    }
    if let Ok(v) = std::env::var("NODEKIT_ROSBRIDGE_URL") {
        cfg.rosbridge_url = v;
    }
    if let Ok(v) = std::env::var("NODEKIT_NODE_NAME") {
        cfg.session.node_name = v;
    }
    if let Ok(v) = std::env::var("NODEKIT_NAMESPACE") {
        cfg.session.namespace = v;
    }
    if let Ok(v) = std::env::var("NODEKIT_SPIN_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.session.spin_interval_ms = ms;
    }
}

/// Save the config to disk, creating `~/.nodekit/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.rosbridge_url = "ws://robot.local:9090".to_string();
        cfg.session.node_name = "operator_gui".to_string();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.rosbridge_url, "ws://robot.local:9090");
        assert_eq!(loaded.session.node_name, "operator_gui");
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nnode_name = \"teleop\"\n").expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.session.node_name, "teleop");
        assert_eq!(loaded.rosbridge_url, DEFAULT_ROSBRIDGE_URL);
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "backend = [").expect("write");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn config_path_points_to_nodekit_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".nodekit"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("Rosbridge".parse::<Backend>(), Ok(Backend::Rosbridge));
        assert_eq!(" loopback ".parse::<Backend>(), Ok(Backend::Loopback));
        assert!("dds".parse::<Backend>().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_backend() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("NODEKIT_BACKEND", "rosbridge") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.backend, Backend::Rosbridge);

        unsafe { std::env::set_var("NODEKIT_BACKEND", "carrier-pigeon") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.backend, Backend::Loopback);
        unsafe { std::env::remove_var("NODEKIT_BACKEND") };
    }

    #[test]
    fn apply_env_overrides_changes_namespace() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("NODEKIT_NAMESPACE", "/robot7") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.session.namespace, "/robot7");
        unsafe { std::env::remove_var("NODEKIT_NAMESPACE") };
    }

    #[test]
    fn apply_env_overrides_changes_spin_interval() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("NODEKIT_SPIN_INTERVAL_MS", "20") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.session.spin_interval_ms, 20);

        unsafe { std::env::set_var("NODEKIT_SPIN_INTERVAL_MS", "fast") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.session.spin_interval_ms, 100);
        unsafe { std::env::remove_var("NODEKIT_SPIN_INTERVAL_MS") };
    }
}
