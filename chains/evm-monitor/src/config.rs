use config::{Config, Environment, File};
use core_logic::{ConfigError, MonitorSettings, NetworkConfig};
use ethers::types::Address;
use serde::Deserialize;
use std::path::Path;

/// An account listed in the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct TrackedAccountConfig {
    pub address: String,
    pub chain_id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub settings: MonitorSettings,
    /// SQLite file. Without it everything is kept in memory.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub track: Vec<TrackedAccountConfig>,
}

impl MonitorConfig {
    /// Reads `path` and applies `MONITOR__*` environment overrides, e.g.
    /// `MONITOR__SETTINGS__RETRIEVAL_BATCH_SIZE=10`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_string(),
            });
        }

        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("MONITOR").separator("__"))
            .build()
            .map_err(|e| ConfigError::ParseError {
                path: path.to_string(),
                msg: e.to_string(),
            })?;

        let config: MonitorConfig =
            settings
                .try_deserialize()
                .map_err(|e| ConfigError::ParseError {
                    path: path.to_string(),
                    msg: e.to_string(),
                })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.networks.is_empty() {
            return Err(ConfigError::MissingField {
                field: "networks".to_string(),
            });
        }

        for network in &self.networks {
            check_url(&format!("networks.{}.rpc_url", network.name), &network.rpc_url)?;
            if let Some(ws_url) = &network.ws_url {
                check_url(&format!("networks.{}.ws_url", network.name), ws_url)?;
            }
            if let Some(index_url) = &network.asset_index_url {
                check_url(&format!("networks.{}.asset_index_url", network.name), index_url)?;
            }
        }
        for (i, network) in self.networks.iter().enumerate() {
            if self.networks[..i].iter().any(|n| n.chain_id == network.chain_id) {
                return Err(ConfigError::InvalidValue {
                    field: "networks".to_string(),
                    reason: format!("chain {} configured twice", network.chain_id),
                });
            }
        }

        let s = &self.settings;
        let positive = [
            ("settings.retrieval_batch_size", s.retrieval_batch_size as u64),
            ("settings.queued_transaction_period_secs", s.queued_transaction_period_secs),
            ("settings.historic_backfill_period_secs", s.historic_backfill_period_secs),
            ("settings.gas_price_poll_period_secs", s.gas_price_poll_period_secs),
            ("settings.historic_window_blocks", s.historic_window_blocks),
            ("settings.historic_scan_attempts", s.historic_scan_attempts as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if s.window_shrink_factor < 2 {
            return Err(ConfigError::InvalidValue {
                field: "settings.window_shrink_factor".to_string(),
                reason: "must be at least 2".to_string(),
            });
        }

        self.tracked_accounts().map(|_| ())
    }

    /// Parsed `track` entries.
    pub fn tracked_accounts(&self) -> Result<Vec<(Address, u64)>, ConfigError> {
        self.track
            .iter()
            .map(|entry| {
                let address = entry.address.parse::<Address>().map_err(|e| {
                    ConfigError::InvalidValue {
                        field: "track.address".to_string(),
                        reason: format!("{}: {}", entry.address, e),
                    }
                })?;
                if !self.networks.iter().any(|n| n.chain_id == entry.chain_id) {
                    return Err(ConfigError::InvalidValue {
                        field: "track.chain_id".to_string(),
                        reason: format!("chain {} is not configured", entry.chain_id),
                    });
                }
                Ok((address, entry.chain_id))
            })
            .collect()
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl {
            field: field.to_string(),
            url: value.to_string(),
        })
}

/// Parses `<address>@<chain_id>` as given on the command line.
pub fn parse_track_arg(value: &str) -> Result<(Address, u64), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        field: "--track".to_string(),
        reason: format!("{}: {}", value, reason),
    };
    let (address, chain_id) = value
        .split_once('@')
        .ok_or_else(|| invalid("expected <address>@<chain_id>"))?;
    let address = address
        .trim()
        .parse::<Address>()
        .map_err(|_| invalid("invalid address"))?;
    let chain_id = chain_id
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid("invalid chain id"))?;
    Ok((address, chain_id))
}
