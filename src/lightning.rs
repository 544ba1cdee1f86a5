//! Lightning node collaborator and BOLT11 decoding.

use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use lightning_invoice::{Bolt11Invoice, ParseOrSemanticError};

/// Short channel id.
pub type ChanId = u64;

/// Represents errors of the Lightning node.
#[derive(Debug)]
pub enum LightningError {
    /// The node does not know the invoice.
    InvoiceNotFound,
    /// The invoice could not be decoded.
    Decode(ParseOrSemanticError),
    /// Error reported by the node.
    Node(String),
}

impl std::fmt::Display for LightningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvoiceNotFound => write!(f, "invoice not found"),
            Self::Node(message) => f.write_str(message),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl std::error::Error for LightningError {}

impl From<ParseOrSemanticError> for LightningError {
    fn from(value: ParseOrSemanticError) -> Self {
        Self::Decode(value)
    }
}

/// State of an outgoing payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    /// In flight.
    Pending,
    /// Settled.
    Succeeded,
    /// Failed or never attempted.
    Failed,
}

/// Status of an outgoing payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentStatus {
    /// Current state.
    pub state: PaymentState,
    /// Why the payment failed, if it did.
    pub failure_reason: String,
    /// Routing fee paid, in msat.
    pub fee_msat: u64,
}

/// A created invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddInvoiceResponse {
    /// BOLT11 payment request.
    pub payment_request: String,
}

/// Outcome of a successful payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayInvoiceResponse {
    /// Routing fee paid, in msat.
    pub fee_msat: u64,
}

/// The Lightning node paying and receiving the off-chain side of swaps.
pub trait LightningNode: Send + Sync {
    /// Name for logs.
    fn name(&self) -> String;

    /// Creates an invoice. Without `preimage` the node picks one.
    fn create_invoice(
        &self,
        amount_sat: u64,
        preimage: Option<&[u8]>,
        expiry_secs: u64,
        memo: &str,
    ) -> Result<AddInvoiceResponse, LightningError>;

    /// Pays `invoice`, blocking until it settles or fails.
    fn pay_invoice(
        &self,
        invoice: &str,
        fee_limit_sat: u64,
        timeout_secs: u64,
        chan_ids: &[ChanId],
    ) -> Result<PayInvoiceResponse, LightningError>;

    /// Status of our payment of `payment_hash`.
    fn payment_status(&self, payment_hash: &sha256::Hash) -> Result<PaymentStatus, LightningError>;

    /// Whether our invoice with `payment_hash` was paid.
    fn check_invoice_paid(&self, payment_hash: &sha256::Hash) -> Result<bool, LightningError>;
}

/// Fields of a BOLT11 invoice the nursery cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    /// Amount in sat. 0 for amountless invoices.
    pub amount_sat: u64,
    /// Payment hash.
    pub payment_hash: sha256::Hash,
    /// Unix time the invoice expires at.
    pub expiry: u64,
}

/// Decodes and verifies a BOLT11 invoice.
pub fn decode_invoice(invoice: &str) -> Result<DecodedInvoice, LightningError> {
    let bolt11 = Bolt11Invoice::from_str(invoice)?;
    let expiry = bolt11.duration_since_epoch() + bolt11.expiry_time();
    Ok(DecodedInvoice {
        amount_sat: bolt11.amount_milli_satoshis().unwrap_or(0) / 1000,
        payment_hash: sha256::Hash::from_byte_array(bolt11.payment_hash().to_byte_array()),
        expiry: expiry.as_secs(),
    })
}
