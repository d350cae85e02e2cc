//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sdlink_core::{DeviceConfig, DEFAULT_PORT};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/sdlink/config.toml or /etc/sdlink/config.toml, or the
/// path given with `--config`.
/// Env overrides: SDLINK_LISTEN_PORT, SDLINK_BOOKS_ROOT, SDLINK_DEVICE_NAME, SDLINK_PASSWORD.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port the desktop connects to (default 9090). 0 picks a free port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Storage root; books land in `<books_root>/<device.books_dir>`.
    #[serde(default = "default_books_root")]
    pub books_root: PathBuf,
    /// Dial the desktop instead of waiting for it: `"host:port"`, or `"auto"` to locate it by broadcast.
    #[serde(default)]
    pub connect: Option<String>,
    /// Longest single wait inside the poll loop, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub device: DeviceConfig,
}

fn default_listen_port() -> u16 {
    DEFAULT_PORT
}
fn default_books_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".local/share/sdlink"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/sdlink"))
}
fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            books_root: default_books_root(),
            connect: None,
            poll_interval_ms: default_poll_interval_ms(),
            device: DeviceConfig::default(),
        }
    }
}

/// How the daemon meets the desktop application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Listen(u16),
    Dial(String, u16),
    Locate,
}

impl Config {
    pub fn target(&self) -> Result<Target> {
        let Some(raw) = self.connect.as_deref().map(str::trim) else {
            return Ok(Target::Listen(self.listen_port));
        };
        if raw.eq_ignore_ascii_case("auto") {
            return Ok(Target::Locate);
        }
        let Some((host, port)) = raw.rsplit_once(':') else {
            bail!("connect must be \"host:port\" or \"auto\", got {raw:?}");
        };
        let port = port
            .parse::<u16>()
            .with_context(|| format!("bad port in connect = {raw:?}"))?;
        Ok(Target::Dial(host.trim_matches(['[', ']']).to_string(), port))
    }
}

/// Load config: defaults, then config file (explicit path, or first existing default path), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c.device
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid [device] section: {e}"))?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("SDLINK_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(root) = var("SDLINK_BOOKS_ROOT").filter(|s| !s.is_empty()) {
        c.books_root = PathBuf::from(root);
    }
    if let Some(name) = var("SDLINK_DEVICE_NAME").filter(|s| !s.is_empty()) {
        c.device.name = name;
    }
    if let Some(password) = var("SDLINK_PASSWORD") {
        c.device.password = (!password.is_empty()).then_some(password);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sdlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/sdlink/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdlink_core::Vocabulary;
    use std::collections::HashMap;

    #[test]
    fn toml_with_device_section() {
        let c: Config = toml::from_str(
            r#"
            listen_port = 9191
            books_root = "/srv/books"

            [device]
            name = "Study Reader"
            extensions = ["epub"]
            vocabulary = "numeric"
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 9191);
        assert_eq!(c.books_root, PathBuf::from("/srv/books"));
        assert_eq!(c.device.name, "Study Reader");
        assert_eq!(c.device.extensions, vec!["epub".to_string()]);
        assert_eq!(c.device.vocabulary, Vocabulary::Numeric);
        assert_eq!(c.device.books_dir, "Books");
        assert_eq!(c.target().unwrap(), Target::Listen(9191));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("listen_prot = 1").is_err());
        assert!(toml::from_str::<Config>("[device]\nnmae = \"x\"").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        let env: HashMap<&str, &str> = [
            ("SDLINK_LISTEN_PORT", "7000"),
            ("SDLINK_BOOKS_ROOT", "/tmp/books"),
            ("SDLINK_DEVICE_NAME", "Env Reader"),
            ("SDLINK_PASSWORD", "hunter2"),
        ]
        .into_iter()
        .collect();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 7000);
        assert_eq!(c.books_root, PathBuf::from("/tmp/books"));
        assert_eq!(c.device.name, "Env Reader");
        assert_eq!(c.device.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn bad_env_port_is_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "SDLINK_LISTEN_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(c.listen_port, DEFAULT_PORT);
    }

    #[test]
    fn connect_targets() {
        let mut c = Config {
            connect: Some("192.168.1.5:9090".into()),
            ..Config::default()
        };
        assert_eq!(c.target().unwrap(), Target::Dial("192.168.1.5".into(), 9090));
        c.connect = Some("AUTO".into());
        assert_eq!(c.target().unwrap(), Target::Locate);
        c.connect = Some("desk".into());
        assert!(c.target().is_err());
        c.connect = Some("desk:http".into());
        assert!(c.target().is_err());
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = 50\n[device]\nname = \"File Reader\"\n").unwrap();
        let c = load(Some(&path)).unwrap();
        assert_eq!(c.poll_interval_ms, 50);
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());

        std::fs::write(&path, "[device]\nextensions = []\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
