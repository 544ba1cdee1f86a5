//! Nursery configuration.
//!
//! Loaded from a flat `config.toml` in the data directory. A commented default file is written
//! when none exists.

use std::{io, io::Write, path::Path};

use bitcoin::Network;

use crate::utill::{get_data_dir, parse_field, parse_toml};

/// Nursery configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NurseryConfig {
    /// Network swaps are made on (default: regtest)
    pub network: Network,
    /// Base URL of the counterparty API
    pub api_url: String,
    /// Base URL of the esplora backend used for BTC
    pub esplora_url: String,
    /// Referral sent with every counterparty request
    pub referral: String,
    /// Largest L-BTC amount accepted with an unconfirmed payment. 0 takes the counterparty's limit
    pub max_zero_conf_amount: u64,
    /// Routing fee limit of reverse swap payments in ppm
    pub max_routing_fee_ppm: u64,
    /// Never ask the counterparty for partial signatures
    pub disable_partial_signatures: bool,
    /// Fee rate used when no estimation is available, in sat/vbyte
    pub fee_fallback_sat_per_vbyte: f64,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            api_url: "http://127.0.0.1:9001".to_string(),
            esplora_url: "http://127.0.0.1:3002".to_string(),
            referral: "swap-nursery".to_string(),
            max_zero_conf_amount: 0,
            max_routing_fee_ppm: 2500,
            disable_partial_signatures: false,
            fee_fallback_sat_per_vbyte: 2.0,
        }
    }
}

impl NurseryConfig {
    /// Constructs a [`NurseryConfig`] from a config file, or creates and loads the default one.
    ///
    /// Without a path, `~/.swap-nursery/config.toml` is used. Missing keys and values of the
    /// wrong type fall back to their defaults.
    pub fn new(config_path: Option<&Path>) -> io::Result<Self> {
        let default_config_path = get_data_dir().join("config.toml");

        let config_path = config_path.unwrap_or(&default_config_path);

        let default_config = Self::default();

        if !config_path.exists() || std::fs::metadata(config_path)?.len() == 0 {
            log::warn!(
                "Nursery config file not found, creating default config file at path: {}",
                config_path.display()
            );
            default_config.write_to_file(config_path)?;
        }

        let config_map = parse_toml(config_path)?;

        log::info!(
            "Successfully loaded config file from : {}",
            config_path.display()
        );

        Ok(NurseryConfig {
            network: parse_field(config_map.get("network"), default_config.network),
            api_url: parse_field(config_map.get("api_url"), default_config.api_url),
            esplora_url: parse_field(config_map.get("esplora_url"), default_config.esplora_url),
            referral: parse_field(config_map.get("referral"), default_config.referral),
            max_zero_conf_amount: parse_field(
                config_map.get("max_zero_conf_amount"),
                default_config.max_zero_conf_amount,
            ),
            max_routing_fee_ppm: parse_field(
                config_map.get("max_routing_fee_ppm"),
                default_config.max_routing_fee_ppm,
            ),
            disable_partial_signatures: parse_field(
                config_map.get("disable_partial_signatures"),
                default_config.disable_partial_signatures,
            ),
            fee_fallback_sat_per_vbyte: parse_field(
                config_map.get("fee_fallback_sat_per_vbyte"),
                default_config.fee_fallback_sat_per_vbyte,
            ),
        })
    }

    /// Serializes the config into TOML and writes it to `path`, creating parent directories.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let toml_data = format!(
            "# Nursery Configuration File
# Network swaps are made on
network = {}
# Counterparty API
api_url = {}
# Esplora backend for BTC
esplora_url = {}
# Referral sent to the counterparty
referral = {}
# Largest L-BTC amount accepted unconfirmed, 0 uses the counterparty limit
max_zero_conf_amount = {}
# Routing fee limit of reverse swap payments in ppm
max_routing_fee_ppm = {}
# Never ask the counterparty for partial signatures
disable_partial_signatures = {}
# Fee rate used when no estimation is available
fee_fallback_sat_per_vbyte = {}",
            self.network,
            self.api_url,
            self.esplora_url,
            self.referral,
            self.max_zero_conf_amount,
            self.max_routing_fee_ppm,
            self.disable_partial_signatures,
            self.fee_fallback_sat_per_vbyte,
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(toml_data.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
