use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub device: DeviceSettings,
    #[serde(default)]
    pub credentials: Option<CredentialSettings>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upgrade the connection to TLS via [STARTTLS] right after connecting
    #[serde(default)]
    pub secure: bool,
    /// Trust self-signed device certificates when `secure` is set
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialSettings {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_auth_wait")]
    pub auth_wait_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            auth_wait_ms: default_auth_wait(),
        }
    }
}

fn default_port() -> u16 {
    crate::connection::DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_auth_wait() -> u64 {
    1000
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            device: DeviceSettings {
                host: "10.0.0.65".to_string(),
                port: default_port(),
                secure: false,
                accept_invalid_certs: true,
            },
            credentials: Some(CredentialSettings {
                username: "jnior".to_string(),
                password: "jnior".to_string(),
            }),
            timeouts: TimeoutSettings::default(),
        }
    }
}
