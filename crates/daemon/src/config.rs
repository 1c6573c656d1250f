//! Daemon configuration, loaded from a file and/or `PORTGATE__*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use portgate_proxy::{ProxyManagerConfig, TlsConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
}

/// Which workspace resource to manage and who owns it.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSettings {
    /// Name of the Workspace resource to reconcile.
    pub name: String,
    pub namespace: String,
    /// User identity the proxies authenticate.
    pub owner_id: String,
    /// Password for the owner; usually supplied via
    /// `PORTGATE__WORKSPACE__OWNER_PASSWORD`.
    pub owner_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub backend_scheme: String,
    pub redirect_path: String,
    pub cookie_name: String,
    /// Zero means sessions never expire.
    pub session_max_age_secs: i64,
    pub graceful_shutdown_secs: u64,
    pub startup_check_secs: u64,
    pub create_timeout_secs: u64,
    /// Serve plain HTTP instead of TLS.
    pub insecure: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        let defaults = ProxyManagerConfig::default();
        Self {
            backend_scheme: defaults.backend_scheme,
            redirect_path: defaults.redirect_path,
            cookie_name: defaults.cookie_name,
            session_max_age_secs: defaults.session_max_age_secs,
            graceful_shutdown_secs: defaults.graceful_shutdown_timeout.as_secs(),
            startup_check_secs: defaults.startup_check_timeout.as_secs(),
            create_timeout_secs: 10,
            insecure: defaults.tls.insecure,
            cert_file: None,
            key_file: None,
        }
    }
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("PORTGATE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("PORTGATE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn manager_config(&self) -> ProxyManagerConfig {
        ProxyManagerConfig {
            owner_id: self.workspace.owner_id.clone(),
            backend_scheme: self.proxy.backend_scheme.clone(),
            redirect_path: self.proxy.redirect_path.clone(),
            cookie_name: self.proxy.cookie_name.clone(),
            session_max_age_secs: self.proxy.session_max_age_secs,
            graceful_shutdown_timeout: Duration::from_secs(self.proxy.graceful_shutdown_secs),
            startup_check_timeout: Duration::from_secs(self.proxy.startup_check_secs),
            tls: TlsConfig {
                insecure: self.proxy.insecure,
                cert_file: self.proxy.cert_file.clone(),
                key_file: self.proxy.key_file.clone(),
            },
        }
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.create_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_settings_override_defaults() {
        let dir = std::env::temp_dir().join("portgate-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        std::fs::write(
            &path,
            r#"
[workspace]
name = "ws1"
namespace = "default"
owner_id = "alice"

[proxy]
session_max_age_secs = 0
graceful_shutdown_secs = 3
"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.workspace.name, "ws1");
        assert_eq!(settings.workspace.owner_password, None);

        let config = settings.manager_config();
        assert_eq!(config.owner_id, "alice");
        assert_eq!(config.session_max_age_secs, 0);
        assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(3));
        // Untouched fields keep their defaults.
        assert_eq!(config.redirect_path, "/portgate");
        assert_eq!(config.cookie_name, "portgate-session");
    }
}
