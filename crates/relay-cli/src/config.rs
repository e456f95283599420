//! Server configuration.
//!
//! Priority: CLI flags > `RELAY_*` environment variables > config file >
//! defaults. The config file is `--config <path>` or `./relay.config.json`
//! when it exists. Only the `server` section of the file is read, so the
//! same file can also hold a bundler config.

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format as _, Json, Serialized},
};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{CliError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "relay.config.json";
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9009;

/// Settings for the HTTP server and worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Worker processes to spawn. Zero builds in the server process.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            workers: 0,
        }
    }
}

/// Only the flags the user actually passed, so unset flags do not override
/// lower layers.
#[derive(Debug, Default, Serialize)]
struct FlagOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workers: Option<usize>,
}

impl ServerConfig {
    /// Load the server configuration for a parsed command line.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_file = match &cli.config {
            Some(path) if !path.exists() => return Err(CliError::FileNotFound(path.clone())),
            Some(path) => Some(path.clone()),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                default_path.exists().then(|| default_path.to_path_buf())
            }
        };

        let flags = FlagOverrides {
            address: cli.address.clone(),
            port: cli.port,
            workers: cli.workers,
        };

        Self::figment(config_file.as_deref(), flags).extract().map_err(CliError::from)
    }

    fn figment(config_file: Option<&Path>, flags: FlagOverrides) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(ServerConfig::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Figment::from(Json::file(path)).focus("server"));
        }

        figment
            .merge(Env::prefixed("RELAY_").only(&["address", "port", "workers"]))
            .merge(Serialized::defaults(flags))
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn extract(config_file: Option<&Path>, flags: FlagOverrides) -> ServerConfig {
        ServerConfig::figment(config_file, flags).extract().unwrap()
    }

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_| {
            assert_eq!(extract(None, FlagOverrides::default()), ServerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "relay.config.json",
                r#"{"entry": "./index.js", "server": {"port": 8000, "workers": 2}}"#,
            )?;
            jail.set_env("RELAY_PORT", "8100");

            let config = extract(
                Some(Path::new("relay.config.json")),
                FlagOverrides {
                    workers: Some(4),
                    ..Default::default()
                },
            );

            assert_eq!(config.address, DEFAULT_ADDRESS);
            assert_eq!(config.port, 8100);
            assert_eq!(config.workers, 4);
            Ok(())
        });
    }

    #[test]
    fn test_file_without_server_section() {
        Jail::expect_with(|jail| {
            jail.create_file("relay.config.json", r#"{"entry": "./index.js"}"#)?;

            let config = extract(Some(Path::new("relay.config.json")), FlagOverrides::default());

            assert_eq!(config, ServerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_url() {
        assert_eq!(ServerConfig::default().url(), "http://127.0.0.1:9009");
    }
}
