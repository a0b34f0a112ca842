use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("active profile '{0}' not found in config")]
    MissingProfile(String),
    #[error("no profiles defined in config")]
    NoProfiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address; the edge usually sits behind the host's TLS layer.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-attempt upstream timeout so one unresponsive mirror cannot block
    /// discovery of a healthy one. 0 disables the timeout.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Cap on the buffered request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_secs > 0).then(|| Duration::from_secs(self.attempt_timeout_secs))
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// One named environment: the ordered mirror lists for both routes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileConfig {
    #[serde(default)]
    pub api_upstreams: Vec<String>,
    #[serde(default)]
    pub auth_upstreams: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EdgeConfig {
    #[serde(default)]
    pub version: Option<u32>,
    /// Which profile serves traffic; switching environments is a one-line
    /// edit here instead of rewriting the upstream lists.
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

impl EdgeConfig {
    /// Resolve the serving profile. When `active_profile` is unset, fall back
    /// to the lexicographically-smallest profile name; HashMap iteration
    /// order is non-deterministic and restarts should not change behavior.
    pub fn active_profile_entry(&self) -> Result<(&str, &ProfileConfig), ConfigError> {
        if let Some(name) = self.active_profile.as_deref() {
            return self
                .profiles
                .get(name)
                .map(|profile| (name, profile))
                .ok_or_else(|| ConfigError::MissingProfile(name.to_string()));
        }
        self.profiles
            .iter()
            .min_by_key(|(name, _)| name.as_str())
            .map(|(name, profile)| (name.as_str(), profile))
            .ok_or(ConfigError::NoProfiles)
    }
}

pub fn config_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".opengater-edge")
}

/// Default config location; `--config` overrides it.
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub async fn load_config(path: &Path) -> Result<EdgeConfig, ConfigError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let mut cfg: EdgeConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
    Ok(cfg)
}

pub const CONFIG_TOML_TEMPLATE: &str = r#"# opengater-edge config.toml
#
# Ordered upstream mirror lists for the edge proxy. Order matters: the first
# entry is tried first, unless a client carries an affinity cookie naming a
# later entry that is still in the list.
#
# Profiles let staging/production carry different mirror sets; switch with
# `active_profile` instead of editing lists in place.

version = 1
active_profile = "production"

[server]
# Listen address and port. Use "0.0.0.0" to accept external traffic directly.
host = "127.0.0.1"
port = 8787
# Per-attempt upstream timeout in seconds; 0 disables it.
attempt_timeout_secs = 10
# Maximum buffered request body size in bytes (10 MiB).
max_body_bytes = 10485760

[profiles.production]
api_upstreams = [
    "https://mirror-a.example",
    "https://mirror-b.example",
]
auth_upstreams = [
    "https://auth-a.example",
    "https://auth-b.example",
]

[profiles.staging]
api_upstreams = ["https://staging.example"]
auth_upstreams = ["https://staging.example"]
"#;

/// Write the commented template. Temp-file-then-rename so readers never see a
/// partial config.
pub async fn write_template(path: &Path, force: bool) -> anyhow::Result<PathBuf> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn template_parses_and_resolves_active_profile() {
        let cfg: EdgeConfig = toml::from_str(CONFIG_TOML_TEMPLATE).expect("template parses");
        let (name, profile) = cfg.active_profile_entry().expect("active profile");
        assert_eq!(name, "production");
        assert_eq!(
            profile.api_upstreams,
            vec!["https://mirror-a.example", "https://mirror-b.example"]
        );
        assert_eq!(
            profile.auth_upstreams,
            vec!["https://auth-a.example", "https://auth-b.example"]
        );
        assert_eq!(cfg.server.port, 8787);
        assert_eq!(cfg.server.attempt_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: EdgeConfig = toml::from_str(
            r#"
[profiles.only]
api_upstreams = ["https://a.example"]
"#,
        )
        .expect("parses");
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 8787);
        assert_eq!(cfg.server.max_body_bytes, 10 * 1024 * 1024);
        let (name, profile) = cfg.active_profile_entry().expect("fallback profile");
        assert_eq!(name, "only");
        assert!(profile.auth_upstreams.is_empty());
    }

    #[test]
    fn unset_active_profile_falls_back_to_smallest_name() {
        let cfg: EdgeConfig = toml::from_str(
            r#"
[profiles.zeta]
api_upstreams = ["https://z.example"]

[profiles.alpha]
api_upstreams = ["https://a.example"]
"#,
        )
        .expect("parses");
        let (name, _) = cfg.active_profile_entry().expect("profile");
        assert_eq!(name, "alpha");
    }

    #[test]
    fn unknown_active_profile_is_an_error() {
        let cfg: EdgeConfig = toml::from_str(
            r#"
active_profile = "missing"

[profiles.real]
api_upstreams = ["https://a.example"]
"#,
        )
        .expect("parses");
        let err = cfg.active_profile_entry().expect_err("missing profile");
        assert!(matches!(err, ConfigError::MissingProfile(ref name) if name == "missing"));
    }

    #[test]
    fn empty_config_has_no_profiles() {
        let cfg = EdgeConfig::default();
        assert!(matches!(
            cfg.active_profile_entry(),
            Err(ConfigError::NoProfiles)
        ));
    }

    #[test]
    fn zero_attempt_timeout_disables_it() {
        let server = ServerConfig {
            attempt_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(server.attempt_timeout(), None);
    }
}
