//! Centralized configuration management for the proxy gateway.
//!
//! All configuration is provided via environment variables and validated
//! once at startup; invalid configuration fails with [`GatewayError::ConfigInvalid`]
//! rather than panicking, since `Server::run` must be able to report it and return.

use std::sync::OnceLock;

use crate::error::GatewayError;

mod env {
    pub const ADDR: &str = "ADDR";
    pub const LICENSE: &str = "LICENSE";
    pub const BACKEND_URL: &str = "BACKEND_URL";
    pub const AUTH: &str = "AUTH";
    pub const PRIVATE_KEY_PATH: &str = "PRIVATE_KEY_PATH";
}

/// Default listen address when `ADDR` is unset.
const DEFAULT_ADDR: &str = ":8080";

/// Default control-plane URL, matching the original gateway's hardcoded backend.
const DEFAULT_BACKEND_URL: &str = "https://havuzbackend.cfapps.io/";

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address the proxy listener binds to.
    pub addr: String,
    /// License bearer token sent as the control-plane Basic-auth password.
    pub license: String,
    /// Control-plane base URL.
    pub backend_url: String,
    /// Optional `user:pass` credential required of clients via `Proxy-Authorization`.
    pub auth: Option<String>,
    /// Filesystem path to the PEM-encoded RSA private key used to sign SSH handshakes.
    pub private_key_path: String,
}

impl Config {
    fn load() -> Result<Self, GatewayError> {
        let addr = std::env::var(env::ADDR).unwrap_or_else(|_| DEFAULT_ADDR.to_string());

        let license = std::env::var(env::LICENSE)
            .map_err(|_| GatewayError::ConfigInvalid(format!("{} is required", env::LICENSE)))?;

        let backend_url =
            std::env::var(env::BACKEND_URL).unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());

        let private_key_path = std::env::var(env::PRIVATE_KEY_PATH).map_err(|_| {
            GatewayError::ConfigInvalid(format!("{} is required", env::PRIVATE_KEY_PATH))
        })?;

        let auth = std::env::var(env::AUTH).ok().filter(|s| !s.is_empty());

        let config = Self {
            addr,
            license,
            backend_url,
            auth,
            private_key_path,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.license.is_empty() {
            return Err(GatewayError::ConfigInvalid("license is required".into()));
        }
        if self.backend_url.is_empty() {
            return Err(GatewayError::ConfigInvalid(
                "backend_url is required".into(),
            ));
        }
        if self.private_key_path.is_empty() {
            return Err(GatewayError::ConfigInvalid(
                "private_key_path is required".into(),
            ));
        }
        Ok(())
    }
}

/// Initialize configuration from the environment. Must be called once at startup.
pub fn init() -> Result<(), GatewayError> {
    let config = Config::load()?;
    // OnceLock::set fails only if already initialized, which we treat as a no-op:
    // tests may call init() more than once within a process.
    let _ = CONFIG.set(config);
    Ok(())
}

/// Get the global configuration. Panics if [`init`] was not called first.
pub fn get() -> &'static Config {
    CONFIG.get().expect("config::init() must be called before config::get()")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_addr_used_when_unset() {
        std::env::remove_var(env::ADDR);
        std::env::set_var(env::LICENSE, "lic");
        std::env::set_var(env::PRIVATE_KEY_PATH, "/tmp/key.pem");
        let config = Config::load().unwrap();
        assert_eq!(config.addr, DEFAULT_ADDR);
        std::env::remove_var(env::LICENSE);
        std::env::remove_var(env::PRIVATE_KEY_PATH);
    }

    #[test]
    fn missing_license_is_config_invalid() {
        std::env::remove_var(env::LICENSE);
        std::env::set_var(env::PRIVATE_KEY_PATH, "/tmp/key.pem");
        let err = Config::load().unwrap_err();
        assert!(matches!(err, GatewayError::ConfigInvalid(_)));
        std::env::remove_var(env::PRIVATE_KEY_PATH);
    }

    #[test]
    fn empty_auth_is_treated_as_absent() {
        std::env::set_var(env::LICENSE, "lic");
        std::env::set_var(env::PRIVATE_KEY_PATH, "/tmp/key.pem");
        std::env::set_var(env::AUTH, "");
        let config = Config::load().unwrap();
        assert!(config.auth.is_none());
        std::env::remove_var(env::LICENSE);
        std::env::remove_var(env::PRIVATE_KEY_PATH);
        std::env::remove_var(env::AUTH);
    }
}
