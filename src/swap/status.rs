//! Counterparty status vocabulary.

use std::{fmt, str::FromStr};

/// Status events pushed by the counterparty for a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapStatus {
    /// `swap.created`
    SwapCreated,
    /// `swap.expired`
    SwapExpired,
    /// `invoice.set`
    InvoiceSet,
    /// `invoice.pending`
    InvoicePending,
    /// `invoice.paid`
    InvoicePaid,
    /// `invoice.settled`
    InvoiceSettled,
    /// `invoice.failedToPay`
    InvoiceFailedToPay,
    /// `invoice.expired`
    InvoiceExpired,
    /// `transaction.mempool`
    TransactionMempool,
    /// `transaction.confirmed`
    TransactionConfirmed,
    /// `transaction.direct`
    TransactionDirect,
    /// `transaction.direct.mempool`
    TransactionDirectMempool,
    /// `transaction.server.mempool`
    TransactionServerMempool,
    /// `transaction.server.confirmed`
    TransactionServerConfirmed,
    /// `transaction.claim.pending`
    TransactionClaimPending,
    /// `transaction.claimed`
    TransactionClaimed,
    /// `transaction.failed`
    TransactionFailed,
    /// `transaction.refunded`
    TransactionRefunded,
    /// `transaction.lockupFailed`
    TransactionLockupFailed,
}

impl SwapStatus {
    const ALL: [SwapStatus; 19] = [
        SwapStatus::SwapCreated,
        SwapStatus::SwapExpired,
        SwapStatus::InvoiceSet,
        SwapStatus::InvoicePending,
        SwapStatus::InvoicePaid,
        SwapStatus::InvoiceSettled,
        SwapStatus::InvoiceFailedToPay,
        SwapStatus::InvoiceExpired,
        SwapStatus::TransactionMempool,
        SwapStatus::TransactionConfirmed,
        SwapStatus::TransactionDirect,
        SwapStatus::TransactionDirectMempool,
        SwapStatus::TransactionServerMempool,
        SwapStatus::TransactionServerConfirmed,
        SwapStatus::TransactionClaimPending,
        SwapStatus::TransactionClaimed,
        SwapStatus::TransactionFailed,
        SwapStatus::TransactionRefunded,
        SwapStatus::TransactionLockupFailed,
    ];

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::SwapCreated => "swap.created",
            SwapStatus::SwapExpired => "swap.expired",
            SwapStatus::InvoiceSet => "invoice.set",
            SwapStatus::InvoicePending => "invoice.pending",
            SwapStatus::InvoicePaid => "invoice.paid",
            SwapStatus::InvoiceSettled => "invoice.settled",
            SwapStatus::InvoiceFailedToPay => "invoice.failedToPay",
            SwapStatus::InvoiceExpired => "invoice.expired",
            SwapStatus::TransactionMempool => "transaction.mempool",
            SwapStatus::TransactionConfirmed => "transaction.confirmed",
            SwapStatus::TransactionDirect => "transaction.direct",
            SwapStatus::TransactionDirectMempool => "transaction.direct.mempool",
            SwapStatus::TransactionServerMempool => "transaction.server.mempool",
            SwapStatus::TransactionServerConfirmed => "transaction.server.confirmed",
            SwapStatus::TransactionClaimPending => "transaction.claim.pending",
            SwapStatus::TransactionClaimed => "transaction.claimed",
            SwapStatus::TransactionFailed => "transaction.failed",
            SwapStatus::TransactionRefunded => "transaction.refunded",
            SwapStatus::TransactionLockupFailed => "transaction.lockupFailed",
        }
    }

    /// Statuses after which the swap completed successfully.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            SwapStatus::InvoiceSettled | SwapStatus::TransactionClaimed
        )
    }

    /// Statuses after which the swap failed on the counterparty side.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            SwapStatus::SwapExpired
                | SwapStatus::InvoiceExpired
                | SwapStatus::InvoiceFailedToPay
                | SwapStatus::TransactionFailed
                | SwapStatus::TransactionRefunded
                | SwapStatus::TransactionLockupFailed
        )
    }

    /// Statuses that may legitimately be delivered more than once.
    pub fn is_repeatable(&self) -> bool {
        matches!(self, SwapStatus::TransactionMempool)
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown swap status: {s}"))
    }
}

/// Funding address statuses that end its lifecycle.
pub struct FundingStatus;

impl FundingStatus {
    /// Funds were spent into a swap.
    pub const SPENT: &'static str = "spent";
    /// The funding address timed out.
    pub const EXPIRED: &'static str = "expired";
    /// Funds were refunded.
    pub const REFUNDED: &'static str = "refunded";

    /// Whether `status` is final.
    pub fn is_final(status: &str) -> bool {
        [Self::SPENT, Self::EXPIRED, Self::REFUNDED].contains(&status)
    }
}
