use config::{Config, ConfigError, Environment, File, Map};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::websocket::{HeartbeatConfig, SessionConfig, UpgradePolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketSettings {
    pub path: String,
    pub max_message_size: usize,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatSettings {
    pub probe_interval_ms: u64,
    pub ack_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub allow_any_origin: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub websocket: WebSocketSettings,
    pub heartbeat: HeartbeatSettings,
    pub cors: CorsConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        Self::build(&run_mode, None)
    }

    /// Layer defaults, optional config files and `APP_` environment variables.
    ///
    /// `env_source` replaces the process environment when set.
    fn build(
        run_mode: &str,
        env_source: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let s = Config::builder()
            // Start with default values
            .set_default("environment", run_mode)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("websocket.path", "/ws")?
            .set_default("websocket.max_message_size", 512)?
            .set_default("websocket.write_timeout_ms", 10_000)?
            .set_default("heartbeat.probe_interval_ms", 5_000)?
            .set_default("heartbeat.ack_grace_ms", 3_000)?
            .set_default("cors.allow_any_origin", true)?

            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))

            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_SERVER__PORT=5001` would set `Settings.server.port`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
                    // E.g., `APP_CORS__ALLOWED_ORIGINS=https://a.example,https://b.example`
                    .list_separator(",")
                    .with_list_parse_key("cors.allowed_origins")
                    .source(env_source)
            )
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would disable a limit or panic the runtime.
    fn validate(&self) -> Result<(), ConfigError> {
        let zero_key = if self.heartbeat.probe_interval_ms == 0 {
            Some("heartbeat.probe_interval_ms")
        } else if self.websocket.max_message_size == 0 {
            Some("websocket.max_message_size")
        } else if self.websocket.write_timeout_ms == 0 {
            Some("websocket.write_timeout_ms")
        } else {
            None
        };

        match zero_key {
            Some(key) => Err(ConfigError::Message(format!(
                "{} must be greater than zero",
                key
            ))),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::build("test", Some(Map::new()))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            probe_interval: Duration::from_millis(self.heartbeat.probe_interval_ms),
            ack_grace: Duration::from_millis(self.heartbeat.ack_grace_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_message_size: self.websocket.max_message_size,
            write_timeout: Duration::from_millis(self.websocket.write_timeout_ms),
            heartbeat: self.heartbeat_config(),
        }
    }

    pub fn upgrade_policy(&self) -> UpgradePolicy {
        UpgradePolicy {
            path: self.websocket.path.clone(),
            allow_any_origin: self.cors.allow_any_origin,
            allowed_origins: self.cors.allowed_origins.clone(),
        }
    }
}
