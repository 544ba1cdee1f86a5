//! Client side of the counterparty API.
//!
//! [`CounterpartyApi`] is the request/response contract the nursery and the transaction constructor
//! depend on. [`client::HttpApi`] implements it over HTTPS, [`ws::EventChannel`] receives the
//! pushed status updates.

pub mod client;
pub mod error;
pub mod ws;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{fees::FeeEstimations, swap::Currency, utill::hex_bytes};
use error::ApiError;

/// A nonce and partial signature of one MuSig2 round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSignatureResponse {
    /// 66 byte public nonce of the signer.
    #[serde(with = "hex_bytes")]
    pub pub_nonce: Vec<u8>,
    /// 32 byte partial signature.
    #[serde(with = "hex_bytes")]
    pub partial_signature: Vec<u8>,
}

/// Request for a cooperative refund signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    /// Our public nonce.
    #[serde(with = "hex_bytes")]
    pub pub_nonce: Vec<u8>,
    /// Hex encoded refund transaction.
    pub transaction: String,
    /// Input to sign.
    pub index: usize,
}

/// Request for a cooperative claim signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    /// Preimage proving the claim.
    #[serde(with = "hex_bytes")]
    pub preimage: Vec<u8>,
    /// Our public nonce.
    #[serde(with = "hex_bytes")]
    pub pub_nonce: Vec<u8>,
    /// Hex encoded claim transaction.
    pub transaction: String,
    /// Input to sign.
    pub index: usize,
}

/// Our signature for the counterparty's chain swap claim, exchanged for theirs on ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapSigningRequest {
    /// Preimage of the swap.
    #[serde(with = "hex_bytes")]
    pub preimage: Vec<u8>,
    /// Partial signature on the counterparty's claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<PartialSignatureResponse>,
    /// Our claim to be signed in return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_sign: Option<ClaimRequest>,
}

/// What the counterparty needs to claim a submarine swap cooperatively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapClaimDetails {
    /// Preimage of the paid invoice.
    #[serde(with = "hex_bytes")]
    pub preimage: Vec<u8>,
    /// Counterparty's public nonce.
    #[serde(with = "hex_bytes")]
    pub pub_nonce: Vec<u8>,
    /// Sighash of the counterparty's claim.
    #[serde(with = "hex_bytes")]
    pub transaction_hash: Vec<u8>,
}

/// What the counterparty needs to claim the user lockup of a chain swap cooperatively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapClaimDetails {
    /// Counterparty's public nonce.
    #[serde(with = "hex_bytes")]
    pub pub_nonce: Vec<u8>,
    /// Counterparty's signing key.
    pub public_key: String,
    /// Sighash of the counterparty's claim.
    #[serde(with = "hex_bytes")]
    pub transaction_hash: Vec<u8>,
    /// Funding address the user lockup sits in, when the swap was funded from one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_address_id: Option<String>,
}

/// Request for a cooperative refund of a funding address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRefundRequest {
    /// Our public nonce.
    #[serde(with = "hex_bytes")]
    pub pub_nonce: Vec<u8>,
    /// Key path sighash of the refund input.
    #[serde(with = "hex_bytes")]
    pub transaction_hash: Vec<u8>,
}

/// What the counterparty needs to spend a funding address into a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingSigningDetails {
    /// Counterparty's public nonce.
    #[serde(with = "hex_bytes")]
    pub pub_nonce: Vec<u8>,
    /// Sighash of the spend.
    #[serde(with = "hex_bytes")]
    pub transaction_hash: Vec<u8>,
}

/// Transaction reference in status updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionInfo {
    /// Transaction id.
    pub id: String,
    /// Raw transaction, when the counterparty sends it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
}

/// Status of a swap, polled or pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SwapStatusUpdate {
    /// Swap id. Empty for polled statuses.
    #[serde(default)]
    pub id: String,
    /// Status string.
    #[serde(default)]
    pub status: String,
    /// Whether the counterparty refuses zero-conf for this swap.
    #[serde(default)]
    pub zero_conf_rejected: bool,
    /// Related transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionInfo>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status of a funding address, pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FundingUpdate {
    /// Funding address id.
    pub id: String,
    /// Status string.
    pub status: String,
    /// Lockup transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionInfo>,
    /// Swap the funds were spent into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_id: Option<String>,
}

/// One lockup of a chain swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSwapLockup {
    /// Lockup transaction.
    pub transaction: TransactionInfo,
}

/// Both lockups of a chain swap, as far as known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapTransactions {
    /// User side lockup.
    #[serde(default)]
    pub user_lock: Option<ChainSwapLockup>,
    /// Counterparty side lockup.
    #[serde(default)]
    pub server_lock: Option<ChainSwapLockup>,
}

/// Limits of a submarine pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineLimits {
    /// Minimal swap amount.
    #[serde(default)]
    pub minimal: u64,
    /// Maximal swap amount.
    #[serde(default)]
    pub maximal: u64,
    /// Largest amount accepted with an unconfirmed lockup.
    #[serde(default)]
    pub maximal_zero_conf: u64,
}

/// Fees of a submarine pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineFees {
    /// Service fee percentage.
    #[serde(default)]
    pub percentage: f64,
    /// Miner fee estimate in sat.
    #[serde(default)]
    pub miner_fees: u64,
}

/// Submarine pair info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubmarinePair {
    /// Limits.
    #[serde(default)]
    pub limits: SubmarineLimits,
    /// Fees.
    #[serde(default)]
    pub fees: SubmarineFees,
}

/// Submarine pairs keyed by `from` then `to` currency.
pub type SubmarinePairs = HashMap<Currency, HashMap<Currency, SubmarinePair>>;

/// Client side contract of the counterparty REST API.
pub trait CounterpartyApi: Send + Sync {
    /// Current status of a swap.
    fn get_swap_status(&self, id: &str) -> Result<SwapStatusUpdate, ApiError>;

    /// Lockup transaction of a submarine swap.
    fn get_swap_transaction(&self, id: &str) -> Result<TransactionInfo, ApiError>;

    /// Lockup transactions of a chain swap.
    fn get_chain_swap_transactions(&self, id: &str) -> Result<ChainSwapTransactions, ApiError>;

    /// Counterparty signature for a cooperative submarine refund.
    fn refund_swap(
        &self,
        id: &str,
        request: &RefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError>;

    /// Counterparty signature for a cooperative chain swap refund.
    fn refund_chain_swap(
        &self,
        id: &str,
        request: &RefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError>;

    /// Counterparty signature for a cooperative reverse swap claim.
    fn claim_reverse_swap(
        &self,
        id: &str,
        request: &ClaimRequest,
    ) -> Result<PartialSignatureResponse, ApiError>;

    /// Details of the counterparty's cooperative submarine claim.
    fn get_swap_claim_details(&self, id: &str) -> Result<SwapClaimDetails, ApiError>;

    /// Our signature for the counterparty's submarine claim.
    fn send_swap_claim_signature(
        &self,
        id: &str,
        signature: &PartialSignatureResponse,
    ) -> Result<(), ApiError>;

    /// Details of the counterparty's cooperative chain swap claim.
    fn get_chain_swap_claim_details(&self, id: &str) -> Result<ChainSwapClaimDetails, ApiError>;

    /// Exchanges our signature on their chain claim for theirs on ours.
    fn exchange_chain_swap_claim_signature(
        &self,
        id: &str,
        request: &ChainSwapSigningRequest,
    ) -> Result<PartialSignatureResponse, ApiError>;

    /// Amount the invoice of a submarine swap must have.
    fn get_invoice_amount(&self, id: &str) -> Result<u64, ApiError>;

    /// Sets the invoice of a submarine swap.
    fn set_invoice(&self, id: &str, invoice: &str) -> Result<(), ApiError>;

    /// New quote for a chain swap whose user lockup did not match.
    fn get_chain_swap_quote(&self, id: &str) -> Result<u64, ApiError>;

    /// Accepts a chain swap quote.
    fn accept_chain_swap_quote(&self, id: &str, amount: u64) -> Result<(), ApiError>;

    /// Submarine pair info.
    fn get_submarine_pairs(&self) -> Result<SubmarinePairs, ApiError>;

    /// Fee rate estimations per currency in sat/vbyte.
    fn get_fee_estimations(&self) -> Result<FeeEstimations, ApiError>;

    /// Details of the counterparty's spend of a funding address into `swap_id`.
    fn get_funding_signing_details(
        &self,
        id: &str,
        swap_id: &str,
    ) -> Result<FundingSigningDetails, ApiError>;

    /// Our signature on the spend of a funding address.
    fn send_funding_signature(
        &self,
        id: &str,
        signature: &PartialSignatureResponse,
    ) -> Result<(), ApiError>;

    /// Counterparty signature for a cooperative refund of a funding address.
    fn refund_funding_address(
        &self,
        id: &str,
        request: &FundingRefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError>;
}
