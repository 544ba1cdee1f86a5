//! Submarine swaps: we lock on-chain, the counterparty pays our invoice and claims.

use bitcoin::hashes::{sha256, Hash};

use super::{clamp_fee, is_duplicate, output::Output, output::OutputHandler, Handled, Nursery};
use crate::{
    api::SwapStatusUpdate,
    error::NurseryError,
    fees::calculate_invoice_expiry,
    lightning::{decode_invoice, LightningError},
    onchain::OutputArgs,
    protocol::{error::ProtocolError, musig2::SigningSession},
    swap::{Swap, SwapState, SwapStatus, SwapType},
};

/// Refund of a submarine lockup.
pub(super) struct SwapRefund {
    id: String,
}

impl OutputHandler for SwapRefund {
    fn on_success(&self, nursery: &Nursery, txid: &str, fee: u64) -> Result<(), NurseryError> {
        let mut swap = nursery.store.get_swap(&self.id)?;
        nursery
            .store
            .set_swap_refund_transaction_id(&mut swap, txid, fee)?;
        log::info!("Refunded swap {} in {txid}", self.id);
        Ok(())
    }

    fn on_failure(&self, nursery: &Nursery, err: &str) {
        log::error!("Could not refund swap {}: {err}", self.id);
        let updated = nursery
            .store
            .get_swap(&self.id)
            .and_then(|mut swap| nursery.store.update_swap_state(&mut swap, SwapState::Error, err));
        if let Err(e) = updated {
            log::error!("Could not update state of swap {}: {e}", self.id);
        }
    }
}

fn swap_output_args(swap: &Swap, transaction_id: &str) -> OutputArgs {
    OutputArgs {
        transaction_id: transaction_id.to_string(),
        currency: swap.pair.from,
        address: swap.lockup_address.clone(),
        expected_amount: swap.expected_amount,
    }
}

impl Nursery {
    /// Registers a new submarine swap for status updates.
    pub fn register_swap(&self, swap: &Swap) -> Result<(), NurseryError> {
        self.register_swaps(&[swap.id.clone()])?;
        self.send_update(swap.clone().into());
        Ok(())
    }

    pub(super) fn swap_refund_output(&self, swap: &Swap) -> Result<Output, NurseryError> {
        Ok(Output {
            swap_id: swap.id.clone(),
            swap_type: SwapType::Submarine,
            address: swap.refund_address.clone(),
            wallet_id: swap.wallet_id,
            tree: swap.swap_tree()?.into(),
            user_lockup_tree: None,
            funding_address_id: None,
            preimage: Vec::new(),
            timeout_block_height: swap.timeout_block_height,
            cooperative: true,
            args: swap_output_args(swap, &swap.lockup_transaction_id),
            handler: Box::new(SwapRefund {
                id: swap.id.clone(),
            }),
        })
    }

    /// Records the lockup of `swap` and the amount it actually locked.
    fn set_swap_lockup(&self, swap: &mut Swap, txid: &str) -> Result<(), NurseryError> {
        let Some(output) = self.resolve_lockup(&swap_output_args(swap, txid))? else {
            self.store.set_swap_lockup_transaction_id(swap, txid)?;
            return Ok(());
        };
        self.store.set_swap_lockup_transaction_id(swap, txid)?;
        self.store.set_swap_expected_amount(swap, output.value)?;
        log::info!(
            "Found lockup {txid} of swap {} with {} sat",
            swap.id,
            output.value
        );

        if swap.wallet_id.is_some() {
            match self.onchain.get_transaction_fee(&output.transaction) {
                Ok(fee) => self.store.set_swap_onchain_fee(swap, fee)?,
                Err(e) => log::warn!("Could not get lockup fee of swap {}: {e}", swap.id),
            }
        }
        Ok(())
    }

    fn create_swap_invoice(&self, swap: &mut Swap) -> Result<(), NurseryError> {
        let amount = self.api.get_invoice_amount(&swap.id)?;
        self.check_amounts(
            SwapType::Submarine,
            swap.pair,
            swap.expected_amount,
            amount,
            swap.service_fee_percent,
        )
        .map_err(|e| {
            NurseryError::General(format!(
                "not accepting invoice amount {amount} from counterparty: {e}"
            ))
        })?;

        let height = self.onchain.get_block_height(swap.pair.from)?;
        let lightning = self.lightning.as_ref().ok_or_else(|| {
            NurseryError::General(format!(
                "no lightning node available, can not create invoice for swap {}",
                swap.id
            ))
        })?;

        let blocks = swap.timeout_block_height.saturating_sub(height);
        let preimage = (!swap.preimage.is_empty()).then_some(swap.preimage.as_slice());
        let invoice = lightning.create_invoice(
            amount,
            preimage,
            calculate_invoice_expiry(blocks, swap.pair.from),
            &format!("Send to {} address", swap.pair.from),
        )?;
        if decode_invoice(&invoice.payment_request)?.payment_hash != swap.payment_hash {
            return Err(NurseryError::General(format!(
                "invoice of {} does not commit to the payment hash of swap {}",
                lightning.name(),
                swap.id
            )));
        }

        self.api.set_invoice(&swap.id, &invoice.payment_request)?;
        self.store.set_swap_invoice(swap, &invoice.payment_request)?;
        log::info!("Set invoice of swap {} for {amount} sat", swap.id);
        Ok(())
    }

    fn check_swap_invoice_paid(&self, swap: &Swap) -> Result<(), NurseryError> {
        let Some(lightning) = &self.lightning else {
            return Ok(());
        };
        let invoice = decode_invoice(&swap.invoice)?;
        match lightning.check_invoice_paid(&invoice.payment_hash) {
            Ok(true) => Ok(()),
            Ok(false) => Err(NurseryError::General(format!(
                "invoice was not actually paid. refunding at block {}",
                swap.timeout_block_height
            ))),
            Err(LightningError::InvoiceNotFound) => {
                log::debug!("Invoice of swap {} is not known to {}", swap.id, lightning.name());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Co-signs the counterparty's key path claim once it proved the invoice was paid.
    fn cooperative_swap_claim(&self, swap: &mut Swap) -> Result<(), NurseryError> {
        let details = self.api.get_swap_claim_details(&swap.id)?;
        let invoice = decode_invoice(&swap.invoice)?;
        if sha256::Hash::hash(&details.preimage) != invoice.payment_hash {
            return Err(ProtocolError::PreimageMismatch.into());
        }
        self.store.set_swap_preimage(swap, &details.preimage)?;

        let mut session = SigningSession::new(&swap.swap_tree()?)?;
        let signature = session.sign(&details.transaction_hash, &details.pub_nonce)?;
        self.api.send_swap_claim_signature(&swap.id, &signature)?;
        log::info!("Sent partial claim signature of swap {}", swap.id);
        Ok(())
    }

    pub(super) fn handle_swap_status(
        &self,
        mut swap: Swap,
        status: SwapStatus,
        update: &SwapStatusUpdate,
    ) -> Result<Handled, NurseryError> {
        if is_duplicate(&swap.status, status, &swap.lockup_transaction_id, update) {
            log::debug!("Status of swap {} is {status} already", swap.id);
            return Ok(Handled::Unchanged);
        }
        log::info!("Status of swap {} changed to: {status}", swap.id);

        let replaced = status.is_repeatable() && !swap.lockup_transaction_id.is_empty();
        if status != SwapStatus::InvoiceSet && (swap.lockup_transaction_id.is_empty() || replaced)
        {
            match self.api.get_swap_transaction(&swap.id) {
                Ok(lockup) => self.set_swap_lockup(&mut swap, &lockup.id)?,
                Err(e) if e.is_counterparty() => {
                    log::debug!("No lockup of swap {} known yet: {e}", swap.id)
                }
                Err(e) => {
                    return Err(NurseryError::General(format!(
                        "could not get lockup transaction from counterparty: {e}"
                    )))
                }
            }
        }

        match status {
            SwapStatus::TransactionMempool | SwapStatus::TransactionConfirmed
                if swap.invoice.is_empty() =>
            {
                self.create_swap_invoice(&mut swap)?;
            }
            SwapStatus::TransactionClaimPending | SwapStatus::TransactionClaimed => {
                self.check_swap_invoice_paid(&swap)?;
                if status == SwapStatus::TransactionClaimPending {
                    if let Err(e) = self.cooperative_swap_claim(&mut swap) {
                        log::warn!("Could not co-sign claim of swap {}: {e}", swap.id);
                    }
                }
            }
            _ => {}
        }

        self.store.update_swap_status(&mut swap, status)?;

        if status.is_completed() {
            let invoice_amount = decode_invoice(&swap.invoice)?.amount_sat;
            let service_fee = swap.service_fee_percent.calculate(invoice_amount);
            let onchain_fee = clamp_fee(
                &swap.id,
                swap.expected_amount as i64 - invoice_amount as i64 - service_fee as i64,
            );
            log::info!(
                "Swap {} service fee: {service_fee} sat, counterparty onchain fee: {onchain_fee} sat",
                swap.id
            );
            self.store
                .set_swap_service_fee(&mut swap, service_fee as i64, onchain_fee)?;
            self.store
                .update_swap_state(&mut swap, SwapState::Successful, "")?;
        } else if status.is_failed() {
            if swap.state == SwapState::Pending {
                self.store
                    .update_swap_state(&mut swap, SwapState::ServerError, "")?;
            }
            if !swap.lockup_transaction_id.is_empty() {
                self.refund(swap.pair.from, &[swap], &[])
                    .map_err(|e| NurseryError::General(format!("could not refund: {e}")))?;
            }
        }

        Ok(Handled::Updated)
    }
}
