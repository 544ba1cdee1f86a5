use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use swap_nursery::{
    api::{client::HttpApi, ws::EventChannel, CounterpartyApi},
    config::NurseryConfig,
    error::NurseryError,
    esplora::EsploraOnchain,
    fee_estimation::FeeEstimator,
    nursery::Nursery,
    onchain::Onchain,
    store::{FileStore, Storage},
    swap::Currency,
    utill::{get_data_dir, setup_logger},
};

/// Swap Nursery Daemon
///
/// Tracks submarine, reverse and chain swaps with the counterparty, claims and refunds them
/// on-chain and logs every swap update. BTC is watched through an esplora backend.
#[derive(Parser, Debug)]
#[clap(version = option_env ! ("CARGO_PKG_VERSION").unwrap_or("unknown"),
author = option_env ! ("CARGO_PKG_AUTHORS").unwrap_or(""))]
struct Cli {
    /// Optional data directory. Default value: "~/.swap-nursery"
    #[clap(long, short = 'd')]
    data_directory: Option<PathBuf>,
    /// Counterparty API URL. Overrides the config file.
    #[clap(long, short = 'a')]
    api_url: Option<String>,
    /// Esplora URL of the BTC backend. Overrides the config file.
    #[clap(long, short = 'e')]
    esplora_url: Option<String>,
    /// Log level: error, warn, info, debug or trace.
    #[clap(long, short = 'l', default_value = "info")]
    log_level: log::LevelFilter,
}

fn main() -> Result<(), NurseryError> {
    let args = Cli::parse();
    let data_dir = args.data_directory.unwrap_or_else(get_data_dir);
    setup_logger(args.log_level, Some(data_dir.clone()));

    let mut config = NurseryConfig::new(Some(&data_dir.join("config.toml")))?;
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }
    if let Some(esplora_url) = args.esplora_url {
        config.esplora_url = esplora_url;
    }

    let api: Arc<dyn CounterpartyApi> = Arc::new(HttpApi::new(
        &config.api_url,
        &config.referral,
        config.disable_partial_signatures,
    )?);
    let fee_estimator = FeeEstimator::new(config.fee_fallback_sat_per_vbyte)
        .with_api(api.clone())
        .with_esplora(&config.esplora_url);
    let onchain = Arc::new(
        Onchain::new(config.network)
            .with_provider(Currency::Btc, Box::new(EsploraOnchain::new(&config.esplora_url)))
            .with_fee_estimator(fee_estimator),
    );
    let store: Arc<dyn Storage> = Arc::new(FileStore::load_or_create(&data_dir)?);
    let events = EventChannel::new(&config.api_url)?;

    let nursery = Arc::new(Nursery::new(&config, onchain, api, events, store));
    let (updates, _unsubscribe) = nursery.global_swap_updates();
    nursery.init()?;

    for update in updates {
        log::info!(
            "{} swap {} is {} ({}){}",
            update.swap.swap_type(),
            update.swap.id(),
            update.swap.state(),
            update.swap.status(),
            if update.is_final { ", final" } else { "" }
        );
    }

    nursery.stop();
    Ok(())
}
