//! On-chain collaborators of the nursery.
//!
//! A [`ChainProvider`] is the per currency chain backend (block height, raw transactions,
//! broadcasting). [`Onchain`] bundles the providers of both currencies with the registered
//! [`Wallet`]s and implements the lookups the swap state machines need on top of them.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use bitcoin::{
    consensus::encode::{deserialize_hex, serialize_hex},
    address::NetworkUnchecked,
    Address, Network, Transaction,
};

use crate::{fee_estimation::FeeEstimator, swap::Currency};

#[cfg(not(feature = "integration-test"))]
const TRANSACTION_RETRY_INTERVAL: Duration = Duration::from_secs(10);
#[cfg(feature = "integration-test")]
const TRANSACTION_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Attempts to fetch a lockup that the counterparty announced before our backend saw it.
const TRANSACTION_RETRIES: u32 = 5;

/// Id of a wallet.
pub type WalletId = u64;

/// Represents errors of the chain backends and wallets.
#[derive(Debug)]
pub enum OnchainError {
    /// No backend is configured for the currency.
    InvalidCurrency(Currency),
    /// The backend can not do this.
    Unsupported(String),
    /// An empty transaction id was passed.
    EmptyTransactionId,
    /// Hex or consensus decoding of a transaction failed.
    Decode(bitcoin::consensus::encode::FromHexError),
    /// Malformed address.
    Address(bitcoin::address::ParseError),
    /// The transaction has no output to the address.
    OutputNotFound(String),
    /// The output holds less than the swap expects.
    LessThanExpected {
        /// Value of the output.
        value: u64,
        /// Amount the swap expects.
        expected: u64,
    },
    /// No wallet with this id is registered.
    WalletNotFound(WalletId),
    /// Error reported by the backend.
    Backend(String),
    /// HTTP transport error.
    Http(minreq::Error),
}

impl std::fmt::Display for OnchainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LessThanExpected { value, expected } => write!(
                f,
                "locked up less onchain coins than expected: {value} < {expected}"
            ),
            Self::OutputNotFound(address) => write!(f, "could not find output for address {address}"),
            Self::WalletNotFound(id) => write!(f, "wallet with id {id} not found"),
            Self::Backend(message) => f.write_str(message),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl std::error::Error for OnchainError {}

impl From<bitcoin::consensus::encode::FromHexError> for OnchainError {
    fn from(value: bitcoin::consensus::encode::FromHexError) -> Self {
        Self::Decode(value)
    }
}

impl From<bitcoin::address::ParseError> for OnchainError {
    fn from(value: bitcoin::address::ParseError) -> Self {
        Self::Address(value)
    }
}

impl From<minreq::Error> for OnchainError {
    fn from(value: minreq::Error) -> Self {
        Self::Http(value)
    }
}

/// A new chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
    /// Height of the tip.
    pub height: u32,
}

/// An unspent output of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Transaction holding the output.
    pub txid: String,
    /// Value in sat.
    pub value: u64,
}

/// A wallet saw a new transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionNotification {
    /// Currency of the transaction.
    pub currency: Currency,
    /// Transaction id.
    pub txid: String,
}

/// Chain backend of one currency.
pub trait ChainProvider: Send + Sync {
    /// Fee rate in sat/vbyte for confirmation within a few blocks.
    fn estimate_fee(&self) -> Result<f64, OnchainError>;
    /// Height of the chain tip.
    fn get_block_height(&self) -> Result<u32, OnchainError>;
    /// Hex encoded transaction.
    fn get_raw_transaction(&self, txid: &str) -> Result<String, OnchainError>;
    /// Broadcasts a hex encoded transaction and returns its id.
    fn broadcast_transaction(&self, hex: &str) -> Result<String, OnchainError>;
    /// Whether the transaction has at least one confirmation.
    fn is_transaction_confirmed(&self, txid: &str) -> Result<bool, OnchainError>;
    /// Unspent outputs of an address.
    fn get_unspent_outputs(&self, address: &str) -> Result<Vec<Output>, OnchainError>;
}

/// Identity of a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletInfo {
    /// Unique id.
    pub id: WalletId,
    /// Display name.
    pub name: String,
    /// Currency the wallet holds.
    pub currency: Currency,
}

/// A wallet the nursery can send claimed and refunded funds to.
pub trait Wallet: Send + Sync {
    /// Identity of the wallet.
    fn info(&self) -> WalletInfo;
    /// Fresh receive address.
    fn new_address(&self) -> Result<String, OnchainError>;
    /// Outputs the wallet knows for one of its addresses.
    fn get_outputs(&self, _address: &str) -> Result<Vec<Output>, OnchainError> {
        Err(OnchainError::Unsupported("wallet can not list outputs".to_string()))
    }
}

/// Where to look for a swap output.
#[derive(Debug, Clone)]
pub struct OutputArgs {
    /// Lockup transaction.
    pub transaction_id: String,
    /// Currency of the lockup.
    pub currency: Currency,
    /// Swap address the output pays.
    pub address: String,
    /// Minimal value. 0 skips the check.
    pub expected_amount: u64,
}

/// A located swap output.
#[derive(Debug, Clone)]
pub struct OutputResult {
    /// Lockup transaction.
    pub transaction: Transaction,
    /// Index of the output.
    pub vout: u32,
    /// Value of the output in sat.
    pub value: u64,
}

struct ChainBackend {
    provider: Box<dyn ChainProvider>,
    block_height: AtomicU32,
}

/// Chain backends of both currencies and the registered wallets.
pub struct Onchain {
    network: Network,
    btc: Option<ChainBackend>,
    liquid: Option<ChainBackend>,
    fee_estimator: Option<FeeEstimator>,
    wallets: RwLock<Vec<Arc<dyn Wallet>>>,
    notifications_tx: Mutex<Sender<TransactionNotification>>,
    notifications_rx: Mutex<Option<Receiver<TransactionNotification>>>,
}

/// Lowest fee rate ever used, in sat/vbyte.
pub fn fee_floor(currency: Currency) -> f64 {
    match currency {
        Currency::Btc => 2.0,
        Currency::Liquid => 0.1,
    }
}

impl Onchain {
    /// Creates an instance without backends.
    pub fn new(network: Network) -> Self {
        let (notifications_tx, notifications_rx) = mpsc::channel();
        Self {
            network,
            btc: None,
            liquid: None,
            fee_estimator: None,
            wallets: RwLock::new(Vec::new()),
            notifications_tx: Mutex::new(notifications_tx),
            notifications_rx: Mutex::new(Some(notifications_rx)),
        }
    }

    /// Sets the backend of `currency`.
    pub fn with_provider(mut self, currency: Currency, provider: Box<dyn ChainProvider>) -> Self {
        let backend = Some(ChainBackend {
            provider,
            block_height: AtomicU32::new(0),
        });
        match currency {
            Currency::Btc => self.btc = backend,
            Currency::Liquid => self.liquid = backend,
        }
        self
    }

    /// Takes fee rates from `estimator` instead of the chain backends.
    pub fn with_fee_estimator(mut self, estimator: FeeEstimator) -> Self {
        self.fee_estimator = Some(estimator);
        self
    }

    /// Network addresses are derived for.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Whether a backend is configured for `currency`.
    pub fn has_provider(&self, currency: Currency) -> bool {
        self.backend(currency).is_ok()
    }

    fn backend(&self, currency: Currency) -> Result<&ChainBackend, OnchainError> {
        match currency {
            Currency::Btc => self.btc.as_ref(),
            Currency::Liquid => self.liquid.as_ref(),
        }
        .ok_or(OnchainError::InvalidCurrency(currency))
    }

    /// Registers a wallet.
    pub fn add_wallet(&self, wallet: Arc<dyn Wallet>) {
        if let Ok(mut wallets) = self.wallets.write() {
            log::info!("Added wallet {:?}", wallet.info());
            wallets.push(wallet);
        }
    }

    /// Unregisters the wallet with `id`.
    pub fn remove_wallet(&self, id: WalletId) {
        if let Ok(mut wallets) = self.wallets.write() {
            wallets.retain(|wallet| wallet.info().id != id);
        }
    }

    /// Registered wallet with `id`.
    pub fn get_wallet(&self, id: WalletId) -> Result<Arc<dyn Wallet>, OnchainError> {
        self.wallets
            .read()
            .ok()
            .and_then(|wallets| wallets.iter().find(|w| w.info().id == id).cloned())
            .ok_or(OnchainError::WalletNotFound(id))
    }

    /// Called by wallet backends when they see a new transaction.
    pub fn notify_transaction(&self, notification: TransactionNotification) {
        if let Ok(tx) = self.notifications_tx.lock() {
            let _ = tx.send(notification);
        }
    }

    /// Takes the wallet transaction stream. Returns `None` after the first call.
    pub fn take_transaction_notifications(&self) -> Option<Receiver<TransactionNotification>> {
        self.notifications_rx.lock().ok()?.take()
    }

    /// Fee rate of `currency`, never below [`fee_floor`].
    pub fn estimate_fee(&self, currency: Currency) -> Result<f64, OnchainError> {
        let fee = match &self.fee_estimator {
            Some(estimator) => estimator.estimate_fee(currency),
            None => self.backend(currency)?.provider.estimate_fee()?,
        };
        Ok(fee.max(fee_floor(currency)))
    }

    /// Last known block height, fetched when none is known yet.
    pub fn get_block_height(&self, currency: Currency) -> Result<u32, OnchainError> {
        let backend = self.backend(currency)?;
        let height = backend.block_height.load(Ordering::SeqCst);
        if height != 0 {
            return Ok(height);
        }
        let height = backend.provider.get_block_height()?;
        backend.block_height.store(height, Ordering::SeqCst);
        Ok(height)
    }

    /// Fetches the tip from the backend and caches it.
    pub fn refresh_block_height(&self, currency: Currency) -> Result<u32, OnchainError> {
        let backend = self.backend(currency)?;
        let height = backend.provider.get_block_height()?;
        backend.block_height.store(height, Ordering::SeqCst);
        Ok(height)
    }

    /// Polls the tip of `currency`. Returns an epoch when it moved past `last`.
    pub fn poll_block(&self, currency: Currency, last: u32) -> Result<Option<BlockEpoch>, OnchainError> {
        let height = self.refresh_block_height(currency)?;
        Ok((height > last).then_some(BlockEpoch { height }))
    }

    /// How often the block listener of `currency` polls the tip.
    pub fn block_poll_interval(&self, currency: Currency) -> Duration {
        if self.network == Network::Regtest {
            return Duration::from_secs(1);
        }
        Duration::from_secs(currency.block_time_minutes() * 60 / 10)
    }

    fn fetch_transaction(&self, currency: Currency, txid: &str) -> Result<Transaction, OnchainError> {
        if txid.is_empty() {
            return Err(OnchainError::EmptyTransactionId);
        }
        if currency != Currency::Btc {
            return Err(OnchainError::Unsupported(format!(
                "decoding {currency} transactions"
            )));
        }
        let hex = self.backend(currency)?.provider.get_raw_transaction(txid)?;
        Ok(deserialize_hex(&hex)?)
    }

    /// Transaction `txid`.
    pub fn get_transaction(&self, currency: Currency, txid: &str) -> Result<Transaction, OnchainError> {
        self.fetch_transaction(currency, txid)
    }

    /// Like [`Onchain::get_transaction`], retrying while the backend does not know the
    /// transaction yet.
    pub fn get_transaction_with_retry(
        &self,
        currency: Currency,
        txid: &str,
    ) -> Result<Transaction, OnchainError> {
        let mut retries = TRANSACTION_RETRIES;
        loop {
            match self.fetch_transaction(currency, txid) {
                Ok(tx) => return Ok(tx),
                Err(e @ (OnchainError::Backend(_) | OnchainError::Http(_))) if retries > 0 => {
                    retries -= 1;
                    log::debug!(
                        "Transaction {txid} not found yet ({e}), retrying in {TRANSACTION_RETRY_INTERVAL:?}"
                    );
                    thread::sleep(TRANSACTION_RETRY_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Broadcasts `tx` and returns its id.
    pub fn broadcast_transaction(
        &self,
        currency: Currency,
        tx: &Transaction,
    ) -> Result<String, OnchainError> {
        self.backend(currency)?
            .provider
            .broadcast_transaction(&serialize_hex(tx))
    }

    /// Whether `txid` is confirmed.
    pub fn is_transaction_confirmed(&self, currency: Currency, txid: &str) -> Result<bool, OnchainError> {
        self.backend(currency)?.provider.is_transaction_confirmed(txid)
    }

    /// Unspent outputs of `address`.
    pub fn get_unspent_outputs(
        &self,
        currency: Currency,
        address: &str,
    ) -> Result<Vec<Output>, OnchainError> {
        self.backend(currency)?.provider.get_unspent_outputs(address)
    }

    /// Fee paid by a BTC transaction, from the values of the outputs it spends.
    pub fn get_transaction_fee(&self, tx: &Transaction) -> Result<u64, OnchainError> {
        let mut inputs: Vec<(bitcoin::Txid, Transaction)> = Vec::new();
        let mut total_in = 0u64;
        for input in &tx.input {
            let prev = input.previous_output;
            if !inputs.iter().any(|(txid, _)| *txid == prev.txid) {
                let parent = self
                    .fetch_transaction(Currency::Btc, &prev.txid.to_string())
                    .map_err(|e| OnchainError::Backend(format!("could not fetch input tx: {e}")))?;
                inputs.push((prev.txid, parent));
            }
            let value = inputs
                .iter()
                .find(|(txid, _)| *txid == prev.txid)
                .and_then(|(_, parent)| parent.output.get(prev.vout as usize))
                .map(|out| out.value.to_sat())
                .ok_or_else(|| OnchainError::OutputNotFound(prev.to_string()))?;
            total_in += value;
        }
        let total_out: u64 = tx.output.iter().map(|out| out.value.to_sat()).sum();
        Ok(total_in.saturating_sub(total_out))
    }

    /// Index and value of the output of `tx` paying `address`.
    pub fn find_vout(&self, tx: &Transaction, address: &str) -> Result<(u32, u64), OnchainError> {
        let script = address
            .parse::<Address<NetworkUnchecked>>()?
            .require_network(self.network)?
            .script_pubkey();
        tx.output
            .iter()
            .enumerate()
            .find(|(_, out)| out.script_pubkey == script)
            .map(|(vout, out)| (vout as u32, out.value.to_sat()))
            .ok_or_else(|| OnchainError::OutputNotFound(address.to_string()))
    }

    /// Fetches the lockup and locates the output paying `args.address`.
    pub fn find_output(&self, args: &OutputArgs) -> Result<OutputResult, OnchainError> {
        let transaction = self.get_transaction_with_retry(args.currency, &args.transaction_id)?;
        let (vout, value) = self.find_vout(&transaction, &args.address)?;
        if args.expected_amount != 0 && value < args.expected_amount {
            return Err(OnchainError::LessThanExpected {
                value,
                expected: args.expected_amount,
            });
        }
        Ok(OutputResult {
            transaction,
            vout,
            value,
        })
    }
}
