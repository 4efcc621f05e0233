use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resolver::ResolverOptions;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Target URI to resolve, e.g. `registry://127.0.0.1:2181/grpc_hello_world_service`.
    pub target: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub dns_refresh_secs: u64,
    pub pick_interval_ms: u64,
    /// Backends registered into the embedded registry for `registry://` targets.
    #[serde(default)]
    pub registry_backends: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: "static://127.0.0.1:50051".into(),
            connect_timeout_ms: 2000,
            request_timeout_ms: 500,
            reconnect_delay_ms: 1000,
            dns_refresh_secs: 30,
            pick_interval_ms: 1000,
            registry_backends: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Self = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("dns_refresh_secs", self.dns_refresh_secs),
            ("pick_interval_ms", self.pick_interval_ms),
        ] {
            anyhow::ensure!(value > 0, "Invalid configuration: {} must be greater than zero", name);
        }
        Ok(())
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("namewatch.toml"))
            .merge(Json::file("namewatch.json"))
            .merge(Env::prefixed("NAMEWATCH_"))
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            dns_refresh: Duration::from_secs(self.dns_refresh_secs),
        }
    }

    pub fn pick_interval(&self) -> Duration {
        Duration::from_millis(self.pick_interval_ms)
    }
}
