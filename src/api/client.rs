//! Blocking HTTPS client of the counterparty REST API.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    error::ApiError, ChainSwapClaimDetails, ChainSwapSigningRequest, ChainSwapTransactions,
    ClaimRequest, CounterpartyApi, FundingRefundRequest, FundingSigningDetails,
    PartialSignatureResponse, RefundRequest, SubmarinePairs, SwapClaimDetails, SwapStatusUpdate, TransactionInfo,
};
use crate::fees::FeeEstimations;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`CounterpartyApi`] over HTTP(S) with `reqwest`.
pub struct HttpApi {
    client: Client,
    base_url: String,
    referral: String,
    disable_partial_signatures: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceAmount {
    invoice_amount: u64,
}

#[derive(Serialize, Deserialize)]
struct Quote {
    amount: u64,
}

impl HttpApi {
    /// Client for the counterparty at `api_url`, e.g. `https://api.example.com`.
    pub fn new(
        api_url: &str,
        referral: &str,
        disable_partial_signatures: bool,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: format!("{}/v2", api_url.trim_end_matches('/')),
            referral: referral.to_string(),
            disable_partial_signatures,
        })
    }

    /// Base URL of the counterparty, without the `/v2` suffix.
    pub fn api_url(&self) -> &str {
        self.base_url.trim_end_matches("/v2")
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.header("Referral", &self.referral).send()?;
        let status = response.status();
        let body = response.text()?;

        let value: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&body) {
                Ok(value) => value,
                Err(e) if status.is_success() => return Err(e.into()),
                Err(_) => return Err(ApiError::Counterparty(format!("{status}: {body}"))),
            }
        };

        if let Some(error) = value.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ApiError::Counterparty(message));
        }
        if !status.is_success() {
            return Err(ApiError::Counterparty(format!("{status}: {body}")));
        }

        Ok(serde_json::from_value(value)?)
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        log::debug!("GET {path}");
        self.send(self.client.get(self.url(path)))
    }

    fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        log::debug!("POST {path}");
        self.send(self.client.post(self.url(path)).json(body))
    }

    fn check_partial_signatures(&self) -> Result<(), ApiError> {
        if self.disable_partial_signatures {
            return Err(ApiError::PartialSignaturesDisabled);
        }
        Ok(())
    }
}

/// Any response body, including an empty one.
#[derive(Deserialize)]
struct Ignored(#[allow(dead_code)] Value);

impl CounterpartyApi for HttpApi {
    fn get_swap_status(&self, id: &str) -> Result<SwapStatusUpdate, ApiError> {
        let mut status: SwapStatusUpdate = self.get(&format!("swap/{id}"))?;
        status.id = id.to_string();
        Ok(status)
    }

    fn get_swap_transaction(&self, id: &str) -> Result<TransactionInfo, ApiError> {
        self.get(&format!("swap/submarine/{id}/transaction"))
    }

    fn get_chain_swap_transactions(&self, id: &str) -> Result<ChainSwapTransactions, ApiError> {
        self.get(&format!("swap/chain/{id}/transactions"))
    }

    fn refund_swap(
        &self,
        id: &str,
        request: &RefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.check_partial_signatures()?;
        self.post(&format!("swap/submarine/{id}/refund"), request)
    }

    fn refund_chain_swap(
        &self,
        id: &str,
        request: &RefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.check_partial_signatures()?;
        self.post(&format!("swap/chain/{id}/refund"), request)
    }

    fn claim_reverse_swap(
        &self,
        id: &str,
        request: &ClaimRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.post(&format!("swap/reverse/{id}/claim"), request)
    }

    fn get_swap_claim_details(&self, id: &str) -> Result<SwapClaimDetails, ApiError> {
        self.check_partial_signatures()?;
        self.get(&format!("swap/submarine/{id}/claim"))
    }

    fn send_swap_claim_signature(
        &self,
        id: &str,
        signature: &PartialSignatureResponse,
    ) -> Result<(), ApiError> {
        let _: Ignored = self.post(&format!("swap/submarine/{id}/claim"), signature)?;
        Ok(())
    }

    fn get_chain_swap_claim_details(&self, id: &str) -> Result<ChainSwapClaimDetails, ApiError> {
        self.check_partial_signatures()?;
        self.get(&format!("swap/chain/{id}/claim"))
    }

    fn exchange_chain_swap_claim_signature(
        &self,
        id: &str,
        request: &ChainSwapSigningRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.post(&format!("swap/chain/{id}/claim"), request)
    }

    fn get_invoice_amount(&self, id: &str) -> Result<u64, ApiError> {
        let amount: InvoiceAmount = self.get(&format!("swap/submarine/{id}/invoice/amount"))?;
        Ok(amount.invoice_amount)
    }

    fn set_invoice(&self, id: &str, invoice: &str) -> Result<(), ApiError> {
        let _: Ignored = self.post(
            &format!("swap/submarine/{id}/invoice"),
            &json!({ "invoice": invoice }),
        )?;
        Ok(())
    }

    fn get_chain_swap_quote(&self, id: &str) -> Result<u64, ApiError> {
        let quote: Quote = self.get(&format!("swap/chain/{id}/quote"))?;
        Ok(quote.amount)
    }

    fn accept_chain_swap_quote(&self, id: &str, amount: u64) -> Result<(), ApiError> {
        let _: Ignored = self.post(&format!("swap/chain/{id}/quote"), &Quote { amount })?;
        Ok(())
    }

    fn get_submarine_pairs(&self) -> Result<SubmarinePairs, ApiError> {
        self.get("swap/submarine")
    }

    fn get_fee_estimations(&self) -> Result<FeeEstimations, ApiError> {
        self.get("chain/fees")
    }

    fn get_funding_signing_details(
        &self,
        id: &str,
        swap_id: &str,
    ) -> Result<FundingSigningDetails, ApiError> {
        self.check_partial_signatures()?;
        self.get(&format!("funding/{id}/signature?swapId={swap_id}"))
    }

    fn send_funding_signature(
        &self,
        id: &str,
        signature: &PartialSignatureResponse,
    ) -> Result<(), ApiError> {
        let _: Ignored = self.post(&format!("funding/{id}/signature"), signature)?;
        Ok(())
    }

    fn refund_funding_address(
        &self,
        id: &str,
        request: &FundingRefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.check_partial_signatures()?;
        self.post(&format!("funding/{id}/refund"), request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
        thread,
    };

    /// Answers a single HTTP request with `status` and `body`, returns the request line.
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut content_length = 0;
            let mut referral = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let lower = line.to_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                if lower.starts_with("referral:") {
                    referral = line.trim().to_string();
                }
                if line == "\r\n" {
                    break;
                }
            }
            let mut body_buf = vec![0u8; content_length];
            reader.read_exact(&mut body_buf).unwrap();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            format!("{} {}", request_line.trim(), referral)
        });
        (url, handle)
    }

    #[test]
    fn test_quote_and_referral() {
        let (url, handle) = serve_once("200 OK", r#"{"amount":12345}"#);
        let api = HttpApi::new(&url, "tests", false).unwrap();
        assert_eq!(api.get_chain_swap_quote("abc").unwrap(), 12345);
        let request = handle.join().unwrap();
        assert!(request.starts_with("GET /v2/swap/chain/abc/quote"));
        assert!(request.to_lowercase().ends_with("referral: tests"));
    }

    #[test]
    fn test_counterparty_error_is_typed() {
        let (url, handle) = serve_once("400 Bad Request", r#"{"error":"swap not found"}"#);
        let api = HttpApi::new(&url, "tests", false).unwrap();
        match api.get_swap_status("missing") {
            Err(ApiError::Counterparty(message)) => assert_eq!(message, "swap not found"),
            other => panic!("unexpected {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_empty_body_is_accepted() {
        let (url, handle) = serve_once("200 OK", "");
        let api = HttpApi::new(&url, "tests", false).unwrap();
        api.set_invoice("abc", "lnbcrt1").unwrap();
        assert!(handle.join().unwrap().starts_with("POST /v2/swap/submarine/abc/invoice"));
    }

    #[test]
    fn test_disabled_partial_signatures() {
        // Nothing listens on this port, the call must not reach the network.
        let api = HttpApi::new("http://127.0.0.1:1", "tests", true).unwrap();
        let request = RefundRequest {
            pub_nonce: vec![],
            transaction: String::new(),
            index: 0,
        };
        assert!(matches!(
            api.refund_swap("abc", &request),
            Err(ApiError::PartialSignaturesDisabled)
        ));
        assert!(matches!(
            api.get_chain_swap_claim_details("abc"),
            Err(ApiError::PartialSignaturesDisabled)
        ));
        let funding_request = FundingRefundRequest {
            pub_nonce: vec![],
            transaction_hash: vec![],
        };
        assert!(matches!(
            api.refund_funding_address("funding", &funding_request),
            Err(ApiError::PartialSignaturesDisabled)
        ));
        assert_eq!(api.api_url(), "http://127.0.0.1:1");
    }
}
