//! Fee Estimation Module
//!
//! Fee rates come from the counterparty's `chain/fees` endpoint first. BTC falls back to an
//! esplora `fee-estimates` backend, everything else to the configured fallback rate.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;

use crate::{
    api::{error::ApiError, CounterpartyApi},
    fees::FeeEstimations,
    swap::Currency,
};

/// Esplora confirmation target used for BTC.
const ESPLORA_BLOCK_TARGET: &str = "2";

/// Represents errors of a single fee source.
#[derive(Debug)]
pub enum FeeEstimatorError {
    /// HTTP transport error.
    Http(minreq::Error),
    /// The counterparty could not give estimations.
    Api(ApiError),
    /// The source answered without the rate we need.
    MissingData(String),
    /// A source thread panicked.
    ThreadError,
}

impl std::fmt::Display for FeeEstimatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for FeeEstimatorError {}

impl From<minreq::Error> for FeeEstimatorError {
    fn from(value: minreq::Error) -> Self {
        Self::Http(value)
    }
}

impl From<ApiError> for FeeEstimatorError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

/// Used to fetch fee rates from the counterparty and esplora.
pub struct FeeEstimator {
    api: Option<Arc<dyn CounterpartyApi>>,
    esplora_url: Option<String>,
    fallback: f64,
}

impl FeeEstimator {
    /// Creates an estimator that always answers `fallback` until sources are added.
    pub fn new(fallback: f64) -> Self {
        Self {
            api: None,
            esplora_url: None,
            fallback,
        }
    }

    /// Asks the counterparty first.
    pub fn with_api(mut self, api: Arc<dyn CounterpartyApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Asks esplora for BTC when the counterparty has no rate.
    pub fn with_esplora(mut self, esplora_url: &str) -> Self {
        self.esplora_url = Some(esplora_url.trim_end_matches('/').to_string());
        self
    }

    /// Fee rate of `currency` in sat/vbyte. Never fails, the last resort is the fallback rate.
    pub fn estimate_fee(&self, currency: Currency) -> f64 {
        let (counterparty, esplora) = std::thread::scope(|s| {
            let counterparty = s.spawn(|| self.fetch_counterparty_fees());
            let esplora = s.spawn(|| match (&self.esplora_url, currency) {
                (Some(url), Currency::Btc) => Some(Self::fetch_esplora_fee(url)),
                _ => None,
            });
            (
                counterparty
                    .join()
                    .unwrap_or(Err(FeeEstimatorError::ThreadError)),
                esplora
                    .join()
                    .unwrap_or(Some(Err(FeeEstimatorError::ThreadError))),
            )
        });

        match counterparty.and_then(|fees| {
            fees.get(&currency).copied().ok_or_else(|| {
                FeeEstimatorError::MissingData(format!("no counterparty estimation for {currency}"))
            })
        }) {
            Ok(fee) => {
                log::debug!("Counterparty fee estimate {currency}: {fee} sat/vB");
                return fee;
            }
            Err(e) => log::debug!("Counterparty fee estimate {currency} unavailable: {e}"),
        }

        match esplora {
            Some(Ok(fee)) => {
                log::debug!("Esplora fee estimate {currency}: {fee} sat/vB");
                fee
            }
            Some(Err(e)) => {
                log::warn!("Could not get esplora fee estimate, using fallback: {e}");
                self.fallback
            }
            None => self.fallback,
        }
    }

    /// Fee rates of `currencies`.
    pub fn estimate_fees(&self, currencies: &[Currency]) -> FeeEstimations {
        currencies
            .iter()
            .map(|currency| (*currency, self.estimate_fee(*currency)))
            .collect()
    }

    fn fetch_counterparty_fees(&self) -> Result<FeeEstimations, FeeEstimatorError> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| FeeEstimatorError::MissingData("no counterparty".to_string()))?;
        Ok(api.get_fee_estimations()?)
    }

    /// Fetches the feerate for confirmation within two blocks from an esplora backend.
    pub fn fetch_esplora_fee(esplora_url: &str) -> Result<f64, FeeEstimatorError> {
        let response = minreq::get(format!("{esplora_url}/fee-estimates"))
            .send()?
            .json::<EsploraFeeResponse>()?
            .fees;

        response.get(ESPLORA_BLOCK_TARGET).copied().ok_or_else(|| {
            FeeEstimatorError::MissingData(format!(
                "No fee estimation for {ESPLORA_BLOCK_TARGET} blocks in Esplora response"
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct EsploraFeeResponse {
    #[serde(flatten)]
    fees: HashMap<String, f64>,
}
