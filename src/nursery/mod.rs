//! The swap lifecycle orchestrator.
//!
//! The [`Nursery`] owns the websocket [`EventChannel`], the listener [`Registry`] and the
//! background threads. Status pushes are processed one at a time: the swap is loaded from the
//! store, handed to the state machine of its kind, persisted and published to listeners.
//!
//! Threads started by [`Nursery::init`]:
//! - the swap update listener, reading the websocket status queue;
//! - one block listener per currency with a chain backend, refunding and claiming on new blocks;
//! - the wallet notification listener, checking reverse swaps paid to external wallets;
//! - the funding address listener.

mod chain;
mod funding;
pub mod listener;
mod output;
mod refund;
mod reverse;
mod submarine;
pub mod tasks;

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
        Arc, Mutex,
    },
};

use bitcoin::Network;

pub use listener::{Broadcast, Registry, Unsubscribe};
pub use tasks::{Cancellation, TaskGroup};

use crate::{
    api::{ws::EventChannel, CounterpartyApi, FundingUpdate, SwapStatusUpdate},
    config::NurseryConfig,
    error::NurseryError,
    fees::{self, required_estimations, FeeEstimations, Percentage},
    lightning::LightningNode,
    onchain::{Onchain, OnchainError, OutputArgs, OutputResult},
    protocol::musig2::SigningSession,
    store::Storage,
    swap::{
        Currency, FundingAddress, FundingStatus, Pair, SomeSwap, SwapState, SwapStatus, SwapType,
        SwapUpdate,
    },
    utill::HEART_BEAT_INTERVAL,
};

/// Outcome of a state machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handled {
    /// Nothing changed, nothing to publish.
    Unchanged,
    /// The swap record changed.
    Updated,
}

/// Whether `update` repeats the recorded status of a swap.
///
/// A repeated `transaction.mempool` still counts as new when it announces a lockup other than
/// the recorded one.
pub(crate) fn is_duplicate(
    recorded_status: &str,
    status: SwapStatus,
    recorded_lockup: &str,
    update: &SwapStatusUpdate,
) -> bool {
    if recorded_status != status.as_str() {
        return false;
    }
    if !status.is_repeatable() {
        return true;
    }
    match &update.transaction {
        Some(tx) if !tx.id.is_empty() => tx.id == recorded_lockup,
        _ => true,
    }
}

/// Clamps a computed fee to zero, warning when it was negative.
pub(crate) fn clamp_fee(id: &str, raw: i64) -> u64 {
    if raw < 0 {
        log::warn!("Swap {id} has negative onchain fee of {raw} sat, setting it to 0");
        return 0;
    }
    raw as u64
}

/// Tracks swaps with the counterparty and settles them on-chain.
pub struct Nursery {
    network: Network,
    max_zero_conf_amount: AtomicU64,
    max_routing_fee_ppm: u64,
    lightning: Option<Arc<dyn LightningNode>>,
    onchain: Arc<Onchain>,
    api: Arc<dyn CounterpartyApi>,
    events: EventChannel,
    store: Arc<dyn Storage>,
    registry: Registry,
    funding_updates: Broadcast<FundingAddress>,
    tasks: TaskGroup,
    /// Serializes status processing with block driven claims.
    update_lock: Mutex<()>,
}

impl Nursery {
    /// Creates a nursery. Nothing runs until [`Nursery::init`].
    pub fn new(
        config: &NurseryConfig,
        onchain: Arc<Onchain>,
        api: Arc<dyn CounterpartyApi>,
        events: EventChannel,
        store: Arc<dyn Storage>,
    ) -> Self {
        Self {
            network: config.network,
            max_zero_conf_amount: AtomicU64::new(config.max_zero_conf_amount),
            max_routing_fee_ppm: config.max_routing_fee_ppm,
            lightning: None,
            onchain,
            api,
            events,
            store,
            registry: Registry::new(),
            funding_updates: Broadcast::new(),
            tasks: TaskGroup::new(),
            update_lock: Mutex::new(()),
        }
    }

    /// Sets the Lightning node paying and receiving invoices.
    pub fn with_lightning(mut self, lightning: Arc<dyn LightningNode>) -> Self {
        self.lightning = Some(lightning);
        self
    }

    /// Largest L-BTC amount accepted unconfirmed.
    pub fn max_zero_conf_amount(&self) -> u64 {
        self.max_zero_conf_amount.load(Ordering::Relaxed)
    }

    /// Connects, starts the background threads and picks up pending swaps.
    pub fn init(self: &Arc<Self>) -> Result<(), NurseryError> {
        if self.max_zero_conf_amount() == 0 {
            let pairs = self.api.get_submarine_pairs()?;
            let limit = pairs
                .get(&Currency::Liquid)
                .and_then(|to| to.get(&Currency::Btc))
                .map(|pair| pair.limits.maximal_zero_conf)
                .ok_or_else(|| {
                    NurseryError::General("no L-BTC/BTC submarine pair".to_string())
                })?;
            self.max_zero_conf_amount.store(limit, Ordering::Relaxed);
            log::info!("No maximal zero conf amount set, using counterparty limit of {limit} sat");
        }

        self.events.connect()?;
        self.start_block_listeners()?;
        self.start_swap_listener()?;
        self.start_transaction_listener()?;
        self.start_funding_listener()?;

        self.recover_swaps()?;
        self.recover_funding_addresses()?;
        log::info!("Nursery initialised");
        Ok(())
    }

    /// Stops every thread and ends all listener streams.
    pub fn stop(&self) {
        log::info!("Stopping nursery");
        self.events.close();
        self.tasks.cancel();
        if let Err(e) = self.tasks.join_all() {
            log::error!("Could not join nursery threads: {e}");
        }
        self.registry.close();
        self.funding_updates.close();
        log::info!("Nursery stopped");
    }

    fn start_swap_listener(self: &Arc<Self>) -> Result<(), NurseryError> {
        let updates = self
            .events
            .take_updates()
            .ok_or_else(|| NurseryError::General("swap updates already taken".to_string()))?;
        let nursery = self.clone();
        self.tasks.spawn("swap-updates", move |cancellation| {
            nursery.run_listener(&updates, &cancellation, |update| {
                nursery.process_update(&update)
            });
            log::debug!("Stopped swap update listener");
        })
    }

    fn start_transaction_listener(self: &Arc<Self>) -> Result<(), NurseryError> {
        let Some(notifications) = self.onchain.take_transaction_notifications() else {
            log::debug!("Wallet notifications already taken");
            return Ok(());
        };
        let nursery = self.clone();
        self.tasks.spawn("wallet-transactions", move |cancellation| {
            nursery.run_listener(&notifications, &cancellation, |notification| {
                log::debug!(
                    "Wallet saw {} transaction {}",
                    notification.currency,
                    notification.txid
                );
                if let Err(e) = nursery.check_external_reverse_swaps(notification.currency) {
                    log::error!("Could not check external reverse swaps: {e}");
                }
            });
            log::debug!("Stopped wallet transaction listener");
        })
    }

    fn start_funding_listener(self: &Arc<Self>) -> Result<(), NurseryError> {
        let updates = self
            .events
            .take_funding_updates()
            .ok_or_else(|| NurseryError::General("funding updates already taken".to_string()))?;
        let nursery = self.clone();
        self.tasks.spawn("funding-updates", move |cancellation| {
            nursery.run_listener(&updates, &cancellation, |update| {
                let id = update.id.clone();
                if let Err(e) = nursery.process_funding_update(update) {
                    log::error!("Could not process update of funding address {id}: {e}");
                }
            });
            log::debug!("Stopped funding update listener");
        })
    }

    /// Feeds `queue` into `handle` until the queue ends or the group is cancelled.
    fn run_listener<T>(
        &self,
        queue: &Receiver<T>,
        cancellation: &Cancellation,
        mut handle: impl FnMut(T),
    ) {
        while !cancellation.is_cancelled() {
            match queue.recv_timeout(HEART_BEAT_INTERVAL) {
                Ok(item) => handle(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn recover_swaps(self: &Arc<Self>) -> Result<(), NurseryError> {
        log::info!("Recovering pending swaps");
        let states = SwapState::RECOVERABLE;
        let mut ids: Vec<String> = self
            .store
            .query_swaps(&states)?
            .into_iter()
            .map(|swap| swap.id)
            .collect();

        for swap in self.store.query_reverse_swaps(&states)? {
            if swap.state == SwapState::Pending {
                if let Err(e) = self.pay_reverse_swap(&swap) {
                    log::error!("Could not pay reverse swap {}: {e}", swap.id);
                    continue;
                }
            }
            ids.push(swap.id);
        }
        ids.extend(
            self.store
                .query_chain_swaps(&states)?
                .into_iter()
                .map(|swap| swap.id),
        );

        log::info!("Recovered {} swaps", ids.len());
        self.register_swaps(&ids)
    }

    fn recover_funding_addresses(&self) -> Result<(), NurseryError> {
        let ids: Vec<String> = self
            .store
            .query_pending_funding_addresses()?
            .into_iter()
            .map(|funding_address| funding_address.id)
            .collect();
        if !ids.is_empty() {
            log::info!("Recovered {} funding addresses", ids.len());
        }
        self.events.subscribe_funding(&ids)?;
        Ok(())
    }

    /// Subscribes to status updates of `ids` and opens their listeners.
    pub fn register_swaps(&self, ids: &[String]) -> Result<(), NurseryError> {
        self.events.subscribe(ids)?;
        self.registry.register(ids);
        Ok(())
    }

    fn send_update(&self, swap: SomeSwap) {
        let update = SwapUpdate::from(swap);
        let id = update.swap.id().to_string();
        if update.is_final {
            self.events.unsubscribe(&id);
        }
        self.registry.send(&id, update);
    }

    /// Sends the persisted state of swap `id` to its listeners.
    fn publish(&self, id: &str) {
        match self.store.get_any_swap(id) {
            Ok(swap) => self.send_update(swap),
            Err(e) => log::error!("Could not load swap {id} to publish it: {e}"),
        }
    }

    /// Persists `err` as the error of swap `id` and publishes it.
    fn fail_swap(&self, id: &str, err: &NurseryError) {
        log::error!("Swap {id} error: {err}");
        let message = err.to_string();
        let updated = self.store.get_any_swap(id).and_then(|swap| match swap {
            SomeSwap::Submarine(mut swap) => {
                self.store
                    .update_swap_state(&mut swap, SwapState::Error, &message)
            }
            SomeSwap::Reverse(mut swap) => {
                self.store
                    .update_reverse_swap_state(&mut swap, SwapState::Error, &message)
            }
            SomeSwap::Chain(mut swap) => {
                self.store
                    .update_chain_swap_state(&mut swap, SwapState::Error, &message)
            }
        });
        if let Err(e) = updated {
            log::error!("Could not update state of swap {id}: {e}");
        }
        self.publish(id);
    }

    /// Runs the state machine of the swap `update` is about.
    pub fn process_update(&self, update: &SwapStatusUpdate) {
        let Ok(_guard) = self.update_lock.lock() else {
            log::error!("Update lock poisoned, dropping update of swap {}", update.id);
            return;
        };

        let swap = match self.store.get_any_swap(&update.id) {
            Ok(swap) => swap,
            Err(e) => {
                log::error!("Could not query swap {}: {e}", update.id);
                return;
            }
        };

        let result = self.handle_update(swap, update);
        match result {
            Ok(Handled::Updated) => self.publish(&update.id),
            Ok(Handled::Unchanged) => {}
            Err(e) => self.fail_swap(&update.id, &e),
        }
    }

    fn handle_update(
        &self,
        swap: SomeSwap,
        update: &SwapStatusUpdate,
    ) -> Result<Handled, NurseryError> {
        if let Some(err) = &update.error {
            return Err(NurseryError::General(format!(
                "counterparty could not find swap {}: {err}",
                update.id
            )));
        }
        let status = match SwapStatus::from_str(&update.status) {
            Ok(status) => status,
            Err(e) => {
                log::warn!("Ignoring update of swap {}: {e}", update.id);
                return Ok(Handled::Unchanged);
            }
        };

        match swap {
            SomeSwap::Submarine(swap) => self.handle_swap_status(swap, status, update),
            SomeSwap::Reverse(swap) => self.handle_reverse_swap_status(swap, status, update),
            SomeSwap::Chain(swap) => self.handle_chain_swap_status(swap, status, update),
        }
    }

    /// Updates of swap `id`. `None` when the swap is not registered or already final.
    pub fn swap_updates(
        &self,
        id: &str,
    ) -> Option<(Receiver<SwapUpdate>, Unsubscribe<SwapUpdate>)> {
        self.registry.updates_for(id)
    }

    /// Updates of every swap.
    pub fn global_swap_updates(&self) -> (Receiver<SwapUpdate>, Unsubscribe<SwapUpdate>) {
        self.registry.global_updates()
    }

    /// Updates of funding addresses.
    pub fn funding_updates(
        &self,
    ) -> (Receiver<FundingAddress>, Unsubscribe<FundingAddress>) {
        self.funding_updates.subscribe()
    }

    /// Fee rates of the currencies `swap_type` on `pair` pays network fees in.
    pub fn get_fee_estimations(
        &self,
        swap_type: SwapType,
        pair: Pair,
    ) -> Result<FeeEstimations, NurseryError> {
        let mut estimations = FeeEstimations::new();
        for currency in required_estimations(swap_type, pair) {
            let fee = self.onchain.estimate_fee(currency).map_err(|e| {
                NurseryError::General(format!("could not get fee estimation for {currency}: {e}"))
            })?;
            estimations.insert(currency, fee);
        }
        Ok(estimations)
    }

    /// Checks the amounts of a swap against the current fee rates.
    pub fn check_amounts(
        &self,
        swap_type: SwapType,
        pair: Pair,
        send_amount: u64,
        receive_amount: u64,
        service_fee: Percentage,
    ) -> Result<(), NurseryError> {
        let estimations = self.get_fee_estimations(swap_type, pair)?;
        fees::check_amounts(
            swap_type,
            pair,
            send_amount,
            receive_amount,
            service_fee,
            &estimations,
            false,
        )?;
        Ok(())
    }

    /// Locates a lockup output. `None` when the chain backend can not decode the lockup.
    fn resolve_lockup(&self, args: &OutputArgs) -> Result<Option<OutputResult>, NurseryError> {
        match self.onchain.find_output(args) {
            Ok(output) => Ok(Some(output)),
            Err(OnchainError::Unsupported(e)) => {
                log::debug!(
                    "Can not verify lockup {} on {}: {e}",
                    args.transaction_id,
                    args.currency
                );
                Ok(None)
            }
            Err(e) => Err(NurseryError::General(format!(
                "could not find lockup vout: {e}"
            ))),
        }
    }

    /// Saves `funding_address` and subscribes to its updates.
    pub fn register_funding_address(
        &self,
        funding_address: &FundingAddress,
    ) -> Result<(), NurseryError> {
        self.store.save_funding_address(funding_address)?;
        self.events
            .subscribe_funding(&[funding_address.id.clone()])?;
        log::info!("Registered funding address {}", funding_address.id);
        Ok(())
    }

    fn process_funding_update(&self, update: FundingUpdate) -> Result<(), NurseryError> {
        let mut funding_address = self.store.get_funding_address(&update.id)?;
        log::info!(
            "Status of funding address {} changed to: {}",
            update.id,
            update.status
        );

        let snapshot = funding_address.clone();
        self.store.run_tx(&mut || {
            funding_address = snapshot.clone();
            self.store
                .update_funding_address_status(&mut funding_address, &update.status)?;
            if let Some(tx) = update.transaction.as_ref().filter(|tx| !tx.id.is_empty()) {
                self.store
                    .set_funding_address_lockup_transaction_id(&mut funding_address, &tx.id)?;
            }
            if let Some(swap_id) = update.swap_id.as_deref().filter(|id| !id.is_empty()) {
                self.store
                    .set_funding_address_swap_id(&mut funding_address, swap_id)?;
            }
            Ok(())
        })?;

        self.funding_updates.send(funding_address.clone());
        if FundingStatus::is_final(&funding_address.status) {
            self.events.unsubscribe_funding(&funding_address.id);
        }
        Ok(())
    }

    /// Co-signs the counterparty's spend of funding address `id` into swap `swap_id`.
    pub fn sign_funding_address(&self, id: &str, swap_id: &str) -> Result<(), NurseryError> {
        let mut funding_address = self.store.get_funding_address(id)?;
        let details = self.api.get_funding_signing_details(id, swap_id)?;

        let mut session = SigningSession::new(&funding_address.funding_tree()?)?;
        let signature = session.sign(&details.transaction_hash, &details.pub_nonce)?;
        self.api.send_funding_signature(id, &signature)?;
        log::info!("Signed spend of funding address {id} into swap {swap_id}");

        if let Err(e) = self
            .store
            .set_funding_address_swap_id(&mut funding_address, swap_id)
        {
            log::warn!("Could not set swap id of funding address {id}: {e}");
        }
        Ok(())
    }
}
