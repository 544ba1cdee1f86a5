//! BTC chain backend over the esplora HTTP API.

use serde::Deserialize;

use crate::{
    fee_estimation::FeeEstimator,
    onchain::{ChainProvider, OnchainError, Output},
};

/// [`ChainProvider`] backed by an esplora instance, e.g. `https://blockstream.info/api`.
pub struct EsploraOnchain {
    url: String,
}

#[derive(Deserialize)]
struct TransactionStatus {
    confirmed: bool,
}

#[derive(Deserialize)]
struct Utxo {
    txid: String,
    value: u64,
}

impl EsploraOnchain {
    /// Backend at `url`. A trailing slash is ignored.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
        }
    }

    fn get(&self, path: &str) -> Result<minreq::Response, OnchainError> {
        let response = minreq::get(format!("{}/{path}", self.url)).send()?;
        Self::check(response)
    }

    fn check(response: minreq::Response) -> Result<minreq::Response, OnchainError> {
        if response.status_code != 200 {
            let body = response.as_str().unwrap_or_default().trim().to_string();
            return Err(OnchainError::Backend(format!(
                "esplora returned {}: {body}",
                response.status_code
            )));
        }
        Ok(response)
    }
}

impl ChainProvider for EsploraOnchain {
    fn estimate_fee(&self) -> Result<f64, OnchainError> {
        FeeEstimator::fetch_esplora_fee(&self.url).map_err(|e| OnchainError::Backend(e.to_string()))
    }

    fn get_block_height(&self) -> Result<u32, OnchainError> {
        let response = self.get("blocks/tip/height")?;
        response
            .as_str()?
            .trim()
            .parse()
            .map_err(|e| OnchainError::Backend(format!("invalid block height: {e}")))
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<String, OnchainError> {
        Ok(self.get(&format!("tx/{txid}/hex"))?.as_str()?.trim().to_string())
    }

    fn broadcast_transaction(&self, hex: &str) -> Result<String, OnchainError> {
        let response = minreq::post(format!("{}/tx", self.url))
            .with_header("Content-Type", "text/plain")
            .with_body(hex)
            .send()?;
        Ok(Self::check(response)?.as_str()?.trim().to_string())
    }

    fn is_transaction_confirmed(&self, txid: &str) -> Result<bool, OnchainError> {
        let status: TransactionStatus = self.get(&format!("tx/{txid}/status"))?.json()?;
        Ok(status.confirmed)
    }

    fn get_unspent_outputs(&self, address: &str) -> Result<Vec<Output>, OnchainError> {
        let utxos: Vec<Utxo> = self.get(&format!("address/{address}/utxo"))?.json()?;
        Ok(utxos
            .into_iter()
            .map(|utxo| Output {
                txid: utxo.txid,
                value: utxo.value,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utxo_json() {
        let json = r#"[{"txid":"ab","vout":1,"status":{"confirmed":false},"value":5000}]"#;
        let utxos: Vec<Utxo> = serde_json::from_str(json).unwrap();
        assert_eq!(utxos[0].txid, "ab");
        assert_eq!(utxos[0].value, 5000);

        let status: TransactionStatus =
            serde_json::from_str(r#"{"confirmed":true,"block_height":120}"#).unwrap();
        assert!(status.confirmed);
        assert_eq!(EsploraOnchain::new("http://localhost:3002/").url, "http://localhost:3002");
    }
}
