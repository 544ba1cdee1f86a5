//! Reverse swaps: we pay the invoice, the counterparty locks on-chain and we claim.

use std::sync::Arc;

use bitcoin::{consensus::encode::deserialize_hex, Transaction};

use super::{clamp_fee, is_duplicate, output::Output, output::OutputHandler, Handled, Nursery};
use crate::{
    api::SwapStatusUpdate,
    error::NurseryError,
    fees::{self, payment_fee_limit, FeeEstimations},
    lightning::{decode_invoice, PaymentState},
    onchain::{self, OnchainError, OutputArgs},
    protocol::swap_tree::CooperativeTree,
    swap::{Currency, ReverseSwap, SwapState, SwapStatus, SwapType},
};

/// Broadcast errors meaning the transaction is already known.
const ALREADY_BROADCAST: [&str; 2] = [
    "transaction already in block chain",
    "transaction outputs already in utxo set",
];

/// Seconds a single payment attempt may take.
const PAYMENT_TIMEOUT_SECS: u64 = 30;

/// Claim of a reverse swap lockup.
pub(super) struct ReverseClaim {
    id: String,
}

impl OutputHandler for ReverseClaim {
    fn on_success(&self, nursery: &Nursery, txid: &str, fee: u64) -> Result<(), NurseryError> {
        let mut swap = nursery.store.get_reverse_swap(&self.id)?;
        nursery
            .store
            .set_reverse_swap_claim_transaction_id(&mut swap, txid, fee)?;
        log::info!("Claimed reverse swap {} in {txid}", self.id);
        Ok(())
    }

    fn on_failure(&self, nursery: &Nursery, err: &str) {
        log::error!("Reverse swap {} error: {err}", self.id);
        let updated = nursery.store.get_reverse_swap(&self.id).and_then(|mut swap| {
            nursery
                .store
                .update_reverse_swap_state(&mut swap, SwapState::Error, err)
        });
        if let Err(e) = updated {
            log::error!("Could not update state of reverse swap {}: {e}", self.id);
        }
    }
}

impl Nursery {
    /// Registers a new reverse swap and starts paying its invoice.
    pub fn register_reverse_swap(self: &Arc<Self>, swap: &ReverseSwap) -> Result<(), NurseryError> {
        self.register_swaps(&[swap.id.clone()])?;
        self.send_update(swap.clone().into());
        self.pay_reverse_swap(swap)
    }

    /// Pays the invoice of `swap` in the background unless it is paid externally or already
    /// being paid.
    pub(super) fn pay_reverse_swap(self: &Arc<Self>, swap: &ReverseSwap) -> Result<(), NurseryError> {
        if swap.external_pay {
            return Ok(());
        }
        let lightning = self.lightning.clone().ok_or_else(|| {
            NurseryError::General("no lightning node available to pay invoice".to_string())
        })?;

        let ppm = swap.routing_fee_limit_ppm.unwrap_or(self.max_routing_fee_ppm);
        let fee_limit = payment_fee_limit(decode_invoice(&swap.invoice)?.amount_sat, ppm);

        match lightning.payment_status(&swap.payment_hash()) {
            Ok(status) if status.state != PaymentState::Failed => {
                log::debug!("Reverse swap {} is already being paid", swap.id);
                return Ok(());
            }
            _ => {}
        }

        let nursery = self.clone();
        let swap = swap.clone();
        self.tasks
            .spawn(&format!("pay-{}", swap.id), move |cancellation| {
                log::debug!("Paying invoice of reverse swap {}", swap.id);
                match lightning.pay_invoice(
                    &swap.invoice,
                    fee_limit,
                    PAYMENT_TIMEOUT_SECS,
                    &swap.chan_ids,
                ) {
                    Ok(payment) => log::info!(
                        "Paid invoice of reverse swap {} with fee of {} msat",
                        swap.id,
                        payment.fee_msat
                    ),
                    Err(e) if cancellation.is_cancelled() => {
                        log::debug!("Payment of reverse swap {} interrupted: {e}", swap.id)
                    }
                    Err(e) => {
                        log::error!("Could not pay invoice {}: {e}", swap.invoice);
                        nursery.fail_swap(&swap.id, &NurseryError::from(e));
                    }
                }
            })
    }

    pub(super) fn reverse_claim_output(&self, swap: &ReverseSwap) -> Result<Output, NurseryError> {
        let swap_tree = swap.swap_tree()?;
        let lockup_address = swap_tree.address(self.network).to_string();
        log::debug!("Derived lockup address of reverse swap {}: {lockup_address}", swap.id);

        Ok(Output {
            swap_id: swap.id.clone(),
            swap_type: SwapType::Reverse,
            address: swap.claim_address.clone(),
            wallet_id: swap.wallet_id,
            tree: swap_tree.into(),
            user_lockup_tree: None,
            funding_address_id: None,
            preimage: swap.preimage.clone(),
            timeout_block_height: swap.timeout_block_height,
            cooperative: true,
            args: OutputArgs {
                transaction_id: swap.lockup_transaction_id.clone(),
                currency: swap.pair.to,
                address: lockup_address,
                expected_amount: swap.onchain_amount,
            },
            handler: Box::new(ReverseClaim {
                id: swap.id.clone(),
            }),
        })
    }

    pub(super) fn handle_reverse_swap_status(
        &self,
        mut swap: ReverseSwap,
        status: SwapStatus,
        update: &SwapStatusUpdate,
    ) -> Result<Handled, NurseryError> {
        if is_duplicate(&swap.status, status, &swap.lockup_transaction_id, update) {
            log::debug!("Status of reverse swap {} is {status} already", swap.id);
            return Ok(Handled::Unchanged);
        }
        log::info!("Status of reverse swap {} changed to: {status}", swap.id);

        match status {
            SwapStatus::TransactionDirect => {
                self.handle_direct_transaction(&mut swap, update)?;
                return Ok(Handled::Updated);
            }
            SwapStatus::TransactionMempool | SwapStatus::TransactionConfirmed => {
                if status == SwapStatus::TransactionMempool {
                    self.store.set_reverse_swap_paid_at(&mut swap)?;
                }
                if swap.claim_transaction_id.is_empty() {
                    let lockup = update
                        .transaction
                        .as_ref()
                        .map(|tx| tx.id.as_str())
                        .filter(|id| !id.is_empty())
                        .ok_or_else(|| {
                            NurseryError::General(format!(
                                "no lockup transaction in {status} update"
                            ))
                        })?;
                    self.store
                        .set_reverse_swap_lockup_transaction_id(&mut swap, lockup)?;

                    if status == SwapStatus::TransactionConfirmed || swap.accept_zero_conf {
                        log::info!("Constructing claim transaction for reverse swap {}", swap.id);
                        let output = self.reverse_claim_output(&swap)?;
                        if let Err(e) = self.create_transaction(swap.pair.to, vec![output]) {
                            log::info!("Could not claim: {e}");
                            return Ok(Handled::Updated);
                        }
                        swap = self.store.get_reverse_swap(&swap.id)?;
                    }
                }
            }
            _ => {}
        }

        self.store.update_reverse_swap_status(&mut swap, status)?;

        if status.is_completed() {
            if let (Some(lightning), false) = (&self.lightning, swap.external_pay) {
                let payment = lightning.payment_status(&swap.payment_hash())?;
                if payment.state == PaymentState::Succeeded {
                    self.store
                        .set_reverse_swap_routing_fee(&mut swap, payment.fee_msat)?;
                } else {
                    log::warn!(
                        "Reverse swap {} has state completed but payment did not succeed",
                        swap.id
                    );
                }
            }

            let service_fee = swap.service_fee_percent.calculate(swap.invoice_amount);
            let onchain_fee = clamp_fee(
                &swap.id,
                swap.invoice_amount as i64 - swap.onchain_amount as i64 - service_fee as i64,
            );
            log::info!(
                "Reverse swap {} service fee: {service_fee} sat, counterparty onchain fee: {onchain_fee} sat",
                swap.id
            );
            self.store
                .set_reverse_swap_service_fee(&mut swap, service_fee as i64, onchain_fee)?;
            self.store
                .update_reverse_swap_state(&mut swap, SwapState::Successful, "")?;
        } else if status.is_failed() && swap.state == SwapState::Pending {
            self.store
                .update_reverse_swap_state(&mut swap, SwapState::ServerError, "")?;
        }

        Ok(Handled::Updated)
    }

    /// The counterparty paid the claim address directly and pushed the transaction.
    fn handle_direct_transaction(
        &self,
        swap: &mut ReverseSwap,
        update: &SwapStatusUpdate,
    ) -> Result<(), NurseryError> {
        let (txid, hex) = update
            .transaction
            .as_ref()
            .and_then(|tx| tx.hex.as_deref().map(|hex| (tx.id.clone(), hex)))
            .ok_or_else(|| {
                NurseryError::General("direct payment update without transaction".to_string())
            })?;
        if swap.pair.to != Currency::Btc {
            return Err(OnchainError::Unsupported(format!(
                "decoding {} transactions",
                swap.pair.to
            ))
            .into());
        }
        let transaction: Transaction = deserialize_hex(hex).map_err(|e| {
            NurseryError::General(format!("could not parse direct transaction: {e}"))
        })?;
        let (_, value) = self.onchain.find_vout(&transaction, &swap.claim_address)?;

        if let Err(e) = self.onchain.broadcast_transaction(swap.pair.to, &transaction) {
            let message = e.to_string().to_lowercase();
            if !ALREADY_BROADCAST.iter().any(|known| message.contains(known)) {
                return Err(NurseryError::General(format!(
                    "could not broadcast transaction: {e}"
                )));
            }
        }

        self.handle_direct_payments(swap, vec![onchain::Output { txid, value }])
    }

    /// Smallest output that is no claim of another swap and pays enough.
    fn choose_direct_output(
        &self,
        swap: &ReverseSwap,
        estimations: &FeeEstimations,
        mut outputs: Vec<onchain::Output>,
    ) -> Result<Option<onchain::Output>, NurseryError> {
        outputs.sort_by_key(|output| output.value);

        for output in outputs {
            if let Some(found) = self
                .store
                .query_reverse_swap_by_claim_transaction(&output.txid)?
            {
                if found.id != swap.id {
                    log::info!("Direct transaction {} is claim of {}", output.txid, found.id);
                    continue;
                }
            }

            if output.value < swap.onchain_amount {
                if let Err(e) = fees::check_amounts(
                    SwapType::Reverse,
                    swap.pair,
                    swap.invoice_amount,
                    output.value,
                    swap.service_fee_percent,
                    estimations,
                    true,
                ) {
                    log::info!("Output from {} does not pass amount checks: {e}", output.txid);
                    continue;
                }
            }
            return Ok(Some(output));
        }
        Ok(None)
    }

    /// Settles `swap` through one of `outputs` paying its claim address.
    pub(super) fn handle_direct_payments(
        &self,
        swap: &mut ReverseSwap,
        outputs: Vec<onchain::Output>,
    ) -> Result<(), NurseryError> {
        log::debug!("Found {} direct payments to reverse swap {}", outputs.len(), swap.id);
        let snapshot = swap.clone();
        let result = self.store.run_tx(&mut || {
            *swap = snapshot.clone();
            let estimations = self.get_fee_estimations(SwapType::Reverse, swap.pair)?;
            let Some(output) = self.choose_direct_output(swap, &estimations, outputs.clone())?
            else {
                return Ok(());
            };

            if swap.pair.to == Currency::Btc || output.value > self.max_zero_conf_amount() {
                match self.onchain.is_transaction_confirmed(swap.pair.to, &output.txid) {
                    Ok(true) | Err(OnchainError::Unsupported(_)) => {}
                    Ok(false) => {
                        log::info!(
                            "Rejecting zero conf for direct payment of swap {}: {}",
                            swap.id,
                            output.txid
                        );
                        self.store
                            .update_reverse_swap_status(swap, SwapStatus::TransactionDirectMempool)?;
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(NurseryError::General(format!(
                            "is transaction confirmed: {e}"
                        )))
                    }
                }
            }

            self.store
                .set_reverse_swap_claim_transaction_id(swap, &output.txid, 0)?;
            self.store.set_reverse_swap_paid_at(swap)?;
            self.store
                .update_reverse_swap_state(swap, SwapState::Successful, "")?;
            self.store
                .update_reverse_swap_status(swap, SwapStatus::TransactionDirect)?;
            log::info!(
                "Reverse swap {} succeeded through direct payment: {}",
                swap.id,
                output.txid
            );
            Ok(())
        });
        result.map_err(|e| NurseryError::General(format!("direct payment: {e}")))
    }

    /// Looks for direct payments to external-pay reverse swaps claiming on `currency`.
    pub(super) fn check_external_reverse_swaps(&self, currency: Currency) -> Result<(), NurseryError> {
        let swaps = self.store.query_reverse_swaps(&SwapState::RECOVERABLE)?;
        for mut swap in swaps {
            let Some(wallet_id) = swap.wallet_id else {
                continue;
            };
            if swap.pair.to != currency || !swap.external_pay || swap.claim_address.is_empty() {
                continue;
            }
            let wallet = self.onchain.get_wallet(wallet_id)?;
            let outputs = match wallet.get_outputs(&swap.claim_address) {
                Ok(outputs) => outputs,
                Err(OnchainError::Unsupported(_)) if currency == Currency::Btc => self
                    .onchain
                    .get_unspent_outputs(currency, &swap.claim_address)?,
                Err(e) => return Err(e.into()),
            };
            if outputs.is_empty() {
                continue;
            }
            match self.handle_direct_payments(&mut swap, outputs) {
                Ok(()) => self.publish(&swap.id),
                Err(e) => self.fail_swap(&swap.id, &e),
            }
        }
        Ok(())
    }
}
