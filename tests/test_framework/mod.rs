//! A framework to write functional tests for the swap nursery.
//!
//! Everything the nursery talks to runs in process:
//! - [`MockApi`] answers the counterparty REST calls from a shared [`ApiState`] and refuses every
//!   partial signature, so cooperative spends fall back to the script path.
//! - [`WsServer`] is a local websocket speaking the counterparty's subscribe/update frames. It
//!   records the ids every connection subscribed and can drop the live connection.
//! - [`MemoryChain`] is the BTC backend, holding raw transactions in memory.
//! - [`MockLightning`] is the Lightning node.
//!
//! Swap records are built with fresh keys, and their lockups are real transactions paying the
//! Taproot address of the swap tree.
//!
//! The test data is stored in a temp dir which is removed when the [`TestFramework`] is dropped.
//! The nursery is stopped on drop as well.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering::SeqCst},
        mpsc::Receiver,
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bitcoin::{
    absolute::LockTime,
    address::NetworkUnchecked,
    consensus::encode::{deserialize_hex, serialize_hex},
    hashes::{sha256, Hash},
    secp256k1::{rand, rand::thread_rng, PublicKey, Secp256k1, SecretKey},
    transaction::Version,
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use bitcoind::tempfile::TempDir;
use log::LevelFilter;
use serde_json::{json, Value};
use tungstenite::Message;

use swap_nursery::{
    api::{
        error::ApiError, ChainSwapClaimDetails, ChainSwapLockup, ChainSwapSigningRequest,
        ChainSwapTransactions, ClaimRequest, CounterpartyApi, FundingRefundRequest,
        FundingSigningDetails, PartialSignatureResponse, RefundRequest, SubmarineLimits, SubmarinePair, SubmarinePairs,
        SwapClaimDetails, SwapStatusUpdate, TransactionInfo,
    },
    api::ws::EventChannel,
    config::NurseryConfig,
    fees::{FeeEstimations, Percentage},
    lightning::{
        AddInvoiceResponse, ChanId, LightningError, LightningNode, PayInvoiceResponse,
        PaymentState, PaymentStatus,
    },
    nursery::Nursery,
    onchain::{ChainProvider, Onchain, OnchainError, Output},
    protocol::swap_tree::CooperativeTree,
    store::{FileStore, Storage},
    swap::{
        ChainSwap, ChainSwapData, Currency, FundingAddress, Pair, ReverseSwap, Swap, SwapState,
        SwapStatus, SwapUpdate,
    },
    utill::setup_logger,
};

/// Regtest invoice over 24_231_412 sat.
pub const INVOICE: &str = "lnbcrt242314120n1p07xy5wpp5th2xv0vdmcx9ure5gs5zcs3vj2y37vg6a35dnl4te79nyq08drdsdqqcqzpgsp5zpwtknhqrdh5rz6lnzst52zt0wj88rjjhx49gxycx7m6z4qgv9ms9qy9qsq520tkslgzqhgsetygx8mc8se928l9favv4jdsmajmeds8ckzaxfrky55sazwx8gpfhx33ys9hg9mpj2vrx8wpe3jmsh8pvwayx2kpkcqm69z2z";
pub const INVOICE_AMOUNT: u64 = 24_231_412;

/// Fee paid by every funding transaction built by [`fund`].
pub const LOCKUP_FEE: u64 = 250;

/// Fee rate of the [`MemoryChain`] in sat/vbyte.
pub const FEE_RATE: f64 = 2.0;

pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(15);
const SERVER_READ_TIMEOUT: Duration = Duration::from_millis(50);

// ---- Chain ----

/// BTC chain backend serving transactions from memory.
#[derive(Default)]
pub struct MemoryChain {
    transactions: Mutex<HashMap<String, String>>,
    unconfirmed: Mutex<HashSet<String>>,
    broadcast: Mutex<Vec<Transaction>>,
    height: AtomicU32,
}

impl MemoryChain {
    pub fn new(height: u32) -> Self {
        let chain = Self::default();
        chain.height.store(height, SeqCst);
        chain
    }

    /// Adds a confirmed transaction and returns its id.
    pub fn add(&self, tx: &Transaction) -> String {
        let txid = tx.compute_txid().to_string();
        self.transactions
            .lock()
            .unwrap()
            .insert(txid.clone(), serialize_hex(tx));
        txid
    }

    pub fn set_confirmed(&self, txid: &str, confirmed: bool) {
        let mut unconfirmed = self.unconfirmed.lock().unwrap();
        if confirmed {
            unconfirmed.remove(txid);
        } else {
            unconfirmed.insert(txid.to_string());
        }
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, SeqCst);
    }

    /// Transactions the nursery broadcast, oldest first.
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcast.lock().unwrap().clone()
    }

    pub fn transaction(&self, txid: &str) -> Transaction {
        let hex = self.transactions.lock().unwrap()[txid].clone();
        deserialize_hex(&hex).unwrap()
    }
}

/// Handle the [`Onchain`] owns while the test keeps the [`MemoryChain`].
struct SharedChain(Arc<MemoryChain>);

impl ChainProvider for SharedChain {
    fn estimate_fee(&self) -> Result<f64, OnchainError> {
        Ok(FEE_RATE)
    }

    fn get_block_height(&self) -> Result<u32, OnchainError> {
        Ok(self.0.height.load(SeqCst))
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<String, OnchainError> {
        self.0
            .transactions
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| OnchainError::Backend(format!("unknown transaction {txid}")))
    }

    fn broadcast_transaction(&self, hex: &str) -> Result<String, OnchainError> {
        let tx: Transaction = deserialize_hex(hex)?;
        let txid = self.0.add(&tx);
        self.0.broadcast.lock().unwrap().push(tx);
        Ok(txid)
    }

    fn is_transaction_confirmed(&self, txid: &str) -> Result<bool, OnchainError> {
        Ok(!self.0.unconfirmed.lock().unwrap().contains(txid))
    }

    fn get_unspent_outputs(&self, address: &str) -> Result<Vec<Output>, OnchainError> {
        let script = address
            .parse::<Address<NetworkUnchecked>>()?
            .require_network(Network::Regtest)?
            .script_pubkey();
        let transactions = self.0.transactions.lock().unwrap();
        let mut outputs = Vec::new();
        for (txid, hex) in transactions.iter() {
            let tx: Transaction = deserialize_hex(hex)?;
            outputs.extend(
                tx.output
                    .iter()
                    .filter(|out| out.script_pubkey == script)
                    .map(|out| Output {
                        txid: txid.clone(),
                        value: out.value.to_sat(),
                    }),
            );
        }
        Ok(outputs)
    }
}

// ---- Counterparty ----

/// What the mocked counterparty knows and what it was asked.
#[derive(Default)]
pub struct ApiState {
    /// Lockup of a submarine swap, by swap id.
    pub swap_lockups: HashMap<String, String>,
    pub chain_lockups: HashMap<String, ChainSwapTransactions>,
    pub invoice_amounts: HashMap<String, u64>,
    pub quotes: HashMap<String, u64>,
    pub accepted_quotes: Vec<(String, u64)>,
    /// Invoices set on submarine swaps.
    pub invoices: HashMap<String, String>,
    /// Ids of swaps whose partial signature was refused.
    pub refused_signatures: Vec<String>,
    pub pairs: SubmarinePairs,
}

/// Counterparty REST API answering from [`ApiState`].
#[derive(Default)]
pub struct MockApi {
    state: Mutex<ApiState>,
}

impl MockApi {
    /// Counterparty with an L-BTC/BTC pair accepting 100_000 sat unconfirmed.
    pub fn new() -> Self {
        let pair = SubmarinePair {
            limits: SubmarineLimits {
                minimal: 1_000,
                maximal: 10_000_000,
                maximal_zero_conf: 100_000,
            },
            ..Default::default()
        };
        let api = Self::default();
        api.state()
            .pairs
            .insert(Currency::Liquid, HashMap::from([(Currency::Btc, pair)]));
        api
    }

    pub fn state(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap()
    }

    fn refuse<T>(&self, id: &str) -> Result<T, ApiError> {
        self.state().refused_signatures.push(id.to_string());
        Err(ApiError::Counterparty("partial signatures are disabled".to_string()))
    }
}

fn not_found<T>(id: &str) -> Result<T, ApiError> {
    Err(ApiError::Counterparty(format!("could not find swap with id: {id}")))
}

impl CounterpartyApi for MockApi {
    fn get_swap_status(&self, id: &str) -> Result<SwapStatusUpdate, ApiError> {
        not_found(id)
    }

    fn get_swap_transaction(&self, id: &str) -> Result<TransactionInfo, ApiError> {
        match self.state().swap_lockups.get(id) {
            Some(txid) => Ok(TransactionInfo {
                id: txid.clone(),
                hex: None,
            }),
            None => not_found(id),
        }
    }

    fn get_chain_swap_transactions(&self, id: &str) -> Result<ChainSwapTransactions, ApiError> {
        match self.state().chain_lockups.get(id) {
            Some(lockups) => Ok(lockups.clone()),
            None => not_found(id),
        }
    }

    fn refund_swap(
        &self,
        id: &str,
        _: &RefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.refuse(id)
    }

    fn refund_chain_swap(
        &self,
        id: &str,
        _: &RefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.refuse(id)
    }

    fn claim_reverse_swap(
        &self,
        id: &str,
        _: &ClaimRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.refuse(id)
    }

    fn get_swap_claim_details(&self, id: &str) -> Result<SwapClaimDetails, ApiError> {
        self.refuse(id)
    }

    fn send_swap_claim_signature(
        &self,
        id: &str,
        _: &PartialSignatureResponse,
    ) -> Result<(), ApiError> {
        self.refuse(id)
    }

    fn get_chain_swap_claim_details(&self, id: &str) -> Result<ChainSwapClaimDetails, ApiError> {
        self.refuse(id)
    }

    fn exchange_chain_swap_claim_signature(
        &self,
        id: &str,
        _: &ChainSwapSigningRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.refuse(id)
    }

    fn get_invoice_amount(&self, id: &str) -> Result<u64, ApiError> {
        match self.state().invoice_amounts.get(id) {
            Some(amount) => Ok(*amount),
            None => not_found(id),
        }
    }

    fn set_invoice(&self, id: &str, invoice: &str) -> Result<(), ApiError> {
        self.state()
            .invoices
            .insert(id.to_string(), invoice.to_string());
        Ok(())
    }

    fn get_chain_swap_quote(&self, id: &str) -> Result<u64, ApiError> {
        match self.state().quotes.get(id) {
            Some(quote) => Ok(*quote),
            None => Err(ApiError::Counterparty("no quote available".to_string())),
        }
    }

    fn accept_chain_swap_quote(&self, id: &str, amount: u64) -> Result<(), ApiError> {
        self.state().accepted_quotes.push((id.to_string(), amount));
        Ok(())
    }

    fn get_submarine_pairs(&self) -> Result<SubmarinePairs, ApiError> {
        Ok(self.state().pairs.clone())
    }

    fn get_fee_estimations(&self) -> Result<FeeEstimations, ApiError> {
        Ok(HashMap::from([(Currency::Btc, FEE_RATE), (Currency::Liquid, 0.1)]))
    }

    fn get_funding_signing_details(
        &self,
        id: &str,
        _: &str,
    ) -> Result<FundingSigningDetails, ApiError> {
        self.refuse(id)
    }

    fn send_funding_signature(
        &self,
        id: &str,
        _: &PartialSignatureResponse,
    ) -> Result<(), ApiError> {
        self.refuse(id)
    }

    fn refund_funding_address(
        &self,
        id: &str,
        _: &FundingRefundRequest,
    ) -> Result<PartialSignatureResponse, ApiError> {
        self.refuse(id)
    }
}

// ---- Lightning ----

/// Lightning node handing out one fixed invoice and recording payments.
pub struct MockLightning {
    invoice: String,
    payments: Mutex<HashMap<sha256::Hash, PaymentStatus>>,
    paid_invoices: Mutex<Vec<String>>,
    invoice_amounts: Mutex<Vec<u64>>,
}

impl MockLightning {
    pub fn new(invoice: &str) -> Self {
        Self {
            invoice: invoice.to_string(),
            payments: Mutex::new(HashMap::new()),
            paid_invoices: Mutex::new(Vec::new()),
            invoice_amounts: Mutex::new(Vec::new()),
        }
    }

    /// Marks the payment of `payment_hash` settled with `fee_msat` routing fee.
    pub fn settle(&self, payment_hash: sha256::Hash, fee_msat: u64) {
        self.payments.lock().unwrap().insert(
            payment_hash,
            PaymentStatus {
                state: PaymentState::Succeeded,
                failure_reason: String::new(),
                fee_msat,
            },
        );
    }

    pub fn paid_invoices(&self) -> Vec<String> {
        self.paid_invoices.lock().unwrap().clone()
    }

    /// Amounts of the invoices created so far.
    pub fn invoice_amounts(&self) -> Vec<u64> {
        self.invoice_amounts.lock().unwrap().clone()
    }
}

impl LightningNode for MockLightning {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn create_invoice(
        &self,
        amount_sat: u64,
        _: Option<&[u8]>,
        _: u64,
        _: &str,
    ) -> Result<AddInvoiceResponse, LightningError> {
        self.invoice_amounts.lock().unwrap().push(amount_sat);
        Ok(AddInvoiceResponse {
            payment_request: self.invoice.clone(),
        })
    }

    fn pay_invoice(
        &self,
        invoice: &str,
        _: u64,
        _: u64,
        _: &[ChanId],
    ) -> Result<PayInvoiceResponse, LightningError> {
        self.paid_invoices.lock().unwrap().push(invoice.to_string());
        Ok(PayInvoiceResponse { fee_msat: 0 })
    }

    fn payment_status(&self, payment_hash: &sha256::Hash) -> Result<PaymentStatus, LightningError> {
        self.payments
            .lock()
            .unwrap()
            .get(payment_hash)
            .cloned()
            .ok_or_else(|| LightningError::Node("payment not found".to_string()))
    }

    fn check_invoice_paid(&self, _: &sha256::Hash) -> Result<bool, LightningError> {
        Ok(true)
    }
}

// ---- Websocket ----

#[derive(Default)]
struct ServerShared {
    shutdown: AtomicBool,
    /// Number of the connection allowed to live. 0 kills the live one.
    current: AtomicUsize,
    /// Subscriptions per connection as (channel, id), in connection order.
    sessions: Mutex<Vec<Vec<(String, String)>>>,
    outbox: Mutex<Vec<String>>,
}

/// Local websocket speaking the counterparty's frames.
pub struct WsServer {
    port: u16,
    shared: Arc<ServerShared>,
    accept_thread: Option<JoinHandle<()>>,
}

impl WsServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();

        let shared = Arc::new(ServerShared::default());
        let accept_shared = shared.clone();
        let accept_thread = thread::spawn(move || {
            while !accept_shared.shutdown.load(SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let shared = accept_shared.clone();
                        thread::spawn(move || serve_connection(stream, shared));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10))
                    }
                    Err(e) => {
                        log::error!("Websocket server stopped accepting: {e}");
                        break;
                    }
                }
            }
        });
        log::info!("Websocket server listening on port {port}");

        Self {
            port,
            shared,
            accept_thread: Some(accept_thread),
        }
    }

    /// Base URL clients derive the websocket URL from.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    /// Swap ids the latest connection subscribed to.
    pub fn swap_subscriptions(&self) -> HashSet<String> {
        self.subscriptions("swap.update")
    }

    /// Funding address ids the latest connection subscribed to.
    pub fn funding_subscriptions(&self) -> HashSet<String> {
        self.subscriptions("funding.update")
    }

    fn subscriptions(&self, channel: &str) -> HashSet<String> {
        let sessions = self.shared.sessions.lock().unwrap();
        sessions
            .last()
            .map(|session| {
                session
                    .iter()
                    .filter(|(subscribed, _)| subscribed == channel)
                    .map(|(_, id)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops the live connection without a closing handshake.
    pub fn drop_connection(&self) {
        self.shared.current.store(0, SeqCst);
    }

    /// Pushes a status update over the live connection.
    pub fn push_update(&self, update: &SwapStatusUpdate) {
        self.push("swap.update", serde_json::to_value(update).unwrap());
    }

    /// Pushes a funding address update over the live connection.
    pub fn push_funding_update(&self, update: Value) {
        self.push("funding.update", update);
    }

    fn push(&self, channel: &str, arg: Value) {
        let frame = json!({ "event": "update", "channel": channel, "args": [arg] });
        self.shared.outbox.lock().unwrap().push(frame.to_string());
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, SeqCst);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve_connection(stream: TcpStream, shared: Arc<ServerShared>) {
    let mut socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("Websocket handshake failed: {e}");
            return;
        }
    };
    socket
        .get_ref()
        .set_read_timeout(Some(SERVER_READ_TIMEOUT))
        .unwrap();

    let number = {
        let mut sessions = shared.sessions.lock().unwrap();
        sessions.push(Vec::new());
        sessions.len()
    };
    shared.current.store(number, SeqCst);
    log::debug!("Websocket server accepted connection {number}");

    loop {
        if shared.shutdown.load(SeqCst) || shared.current.load(SeqCst) != number {
            log::debug!("Websocket server dropping connection {number}");
            return;
        }

        let frames = std::mem::take(&mut *shared.outbox.lock().unwrap());
        for frame in frames {
            if let Err(e) = socket.send(Message::text(frame)) {
                log::warn!("Websocket server could not push: {e}");
                return;
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if request["op"] != "subscribe" {
                    continue;
                }
                let channel = request["channel"].as_str().unwrap_or_default().to_string();
                let ids: Vec<String> = request["args"]
                    .as_array()
                    .map(|args| {
                        args.iter()
                            .filter_map(|id| id.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                shared.sessions.lock().unwrap()[number - 1]
                    .extend(ids.iter().map(|id| (channel.clone(), id.clone())));

                let ack = json!({ "event": "subscribe", "channel": channel, "args": ids });
                if socket.send(Message::text(ack.to_string())).is_err() {
                    return;
                }
            }
            Ok(Message::Close(_)) => return,
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }
    }
}

// ---- Nursery ----

/// A nursery wired to the mocks.
pub struct TestFramework {
    pub nursery: Arc<Nursery>,
    pub api: Arc<MockApi>,
    pub chain: Arc<MemoryChain>,
    pub lightning: Arc<MockLightning>,
    pub store: Arc<FileStore>,
    pub ws: WsServer,
    temp_dir: TempDir,
}

impl TestFramework {
    /// Builds a nursery at block `height`. Nothing runs until [`TestFramework::start`].
    pub fn new(height: u32) -> Self {
        let temp_dir = TempDir::new().unwrap();
        setup_logger(LevelFilter::Info, Some(temp_dir.path().to_path_buf()));

        let ws = WsServer::start();
        let api = Arc::new(MockApi::new());
        let chain = Arc::new(MemoryChain::new(height));
        let lightning = Arc::new(MockLightning::new(INVOICE));
        let store = Arc::new(FileStore::load_or_create(temp_dir.path()).unwrap());

        let config = NurseryConfig {
            network: Network::Regtest,
            api_url: ws.url(),
            ..Default::default()
        };
        let onchain = Arc::new(
            Onchain::new(Network::Regtest)
                .with_provider(Currency::Btc, Box::new(SharedChain(chain.clone()))),
        );
        let events = EventChannel::new(&config.api_url).unwrap();
        let nursery = Nursery::new(
            &config,
            onchain,
            api.clone() as Arc<dyn CounterpartyApi>,
            events,
            store.clone() as Arc<dyn Storage>,
        )
        .with_lightning(lightning.clone() as Arc<dyn LightningNode>);

        Self {
            nursery: Arc::new(nursery),
            api,
            chain,
            lightning,
            store,
            ws,
            temp_dir,
        }
    }

    /// Builds and starts a nursery at block `height`.
    pub fn init(height: u32) -> Self {
        let framework = Self::new(height);
        framework.start();
        framework
    }

    pub fn start(&self) {
        self.nursery.init().unwrap();
    }

    /// Subscribes to the updates of swap `id`.
    pub fn listen(&self, id: &str) -> Receiver<SwapUpdate> {
        let (updates, _unsubscribe) = self.nursery.swap_updates(id).unwrap();
        updates
    }
}

impl Drop for TestFramework {
    fn drop(&mut self) {
        log::info!("Stopping test framework");
        self.nursery.stop();
    }
}

// ---- Records ----

pub fn keypair() -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let key = SecretKey::new(&mut thread_rng());
    (key, key.public_key(&secp))
}

pub fn fresh_address() -> Address {
    let secp = Secp256k1::new();
    let (_, public_key) = keypair();
    Address::p2tr(&secp, public_key.x_only_public_key().0, None, Network::Regtest)
}

fn transaction(inputs: Vec<OutPoint>, outputs: Vec<(ScriptBuf, u64)>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .into_iter()
            .map(|(script_pubkey, value)| TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            })
            .collect(),
    }
}

/// Puts a transaction paying `value` to `address` on `chain`, funded by a parent paying
/// [`LOCKUP_FEE`] more.
pub fn fund(chain: &MemoryChain, address: &str, value: u64) -> Transaction {
    let script = address
        .parse::<Address<NetworkUnchecked>>()
        .unwrap()
        .require_network(Network::Regtest)
        .unwrap()
        .script_pubkey();
    let coinbase = OutPoint::new(Txid::from_byte_array(rand::random()), 0);
    let parent = transaction(
        vec![coinbase],
        vec![(fresh_address().script_pubkey(), value + LOCKUP_FEE)],
    );
    chain.add(&parent);

    let lockup = transaction(
        vec![OutPoint::new(parent.compute_txid(), 0)],
        vec![(script, value)],
    );
    chain.add(&lockup);
    lockup
}

/// Status update of swap `id`, optionally naming a transaction.
pub fn status_update(id: &str, status: SwapStatus, txid: Option<&str>) -> SwapStatusUpdate {
    SwapStatusUpdate {
        id: id.to_string(),
        status: status.to_string(),
        transaction: txid.map(|txid| TransactionInfo {
            id: txid.to_string(),
            hex: None,
        }),
        ..Default::default()
    }
}

/// Next update of a listener. Panics after a timeout.
pub fn next_update(updates: &Receiver<SwapUpdate>) -> SwapUpdate {
    updates
        .recv_timeout(UPDATE_TIMEOUT)
        .expect("no swap update received")
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Submarine swap over [`INVOICE`] locking `expected_amount`, without invoice set yet.
pub fn submarine_swap(id: &str, expected_amount: u64, timeout_block_height: u32) -> Swap {
    let (private_key, _) = keypair();
    let (_, counterparty_public_key) = keypair();
    let payment_hash = swap_nursery::lightning::decode_invoice(INVOICE)
        .unwrap()
        .payment_hash;
    let mut swap = Swap {
        id: id.to_string(),
        pair: Pair::new(Currency::Btc, Currency::Btc),
        chan_ids: Vec::new(),
        state: SwapState::Pending,
        error: String::new(),
        status: String::new(),
        created_at: 0,
        private_key: private_key.into(),
        counterparty_public_key,
        preimage: Vec::new(),
        payment_hash,
        invoice: String::new(),
        lockup_address: String::new(),
        expected_amount,
        timeout_block_height,
        lockup_transaction_id: String::new(),
        refund_transaction_id: String::new(),
        refund_address: fresh_address().to_string(),
        wallet_id: None,
        is_auto: false,
        service_fee_percent: Percentage(0.1),
        service_fee: None,
        onchain_fee: None,
    };
    swap.lockup_address = swap
        .swap_tree()
        .unwrap()
        .address(Network::Regtest)
        .to_string();
    swap
}

/// Reverse swap paying [`INVOICE`] with a 0.5% service fee.
pub fn reverse_swap(
    id: &str,
    invoice_amount: u64,
    onchain_amount: u64,
    timeout_block_height: u32,
) -> ReverseSwap {
    let (private_key, _) = keypair();
    let (_, counterparty_public_key) = keypair();
    ReverseSwap {
        id: id.to_string(),
        pair: Pair::new(Currency::Btc, Currency::Btc),
        chan_ids: Vec::new(),
        state: SwapState::Pending,
        error: String::new(),
        status: String::new(),
        created_at: 0,
        paid_at: None,
        accept_zero_conf: false,
        private_key: private_key.into(),
        counterparty_public_key,
        preimage: rand::random::<[u8; 32]>().to_vec(),
        invoice: INVOICE.to_string(),
        claim_address: fresh_address().to_string(),
        onchain_amount,
        invoice_amount,
        timeout_block_height,
        lockup_transaction_id: String::new(),
        claim_transaction_id: String::new(),
        routing_fee_msat: None,
        routing_fee_limit_ppm: None,
        external_pay: false,
        wallet_id: None,
        is_auto: false,
        service_fee_percent: Percentage(0.5),
        service_fee: None,
        onchain_fee: None,
    }
}

/// Address the counterparty locks a reverse swap to.
pub fn reverse_lockup_address(swap: &ReverseSwap) -> String {
    swap.swap_tree()
        .unwrap()
        .address(Network::Regtest)
        .to_string()
}

fn chain_swap_data(id: &str, amount: u64, timeout_block_height: u32) -> ChainSwapData {
    let (private_key, _) = keypair();
    let (_, their_public_key) = keypair();
    ChainSwapData {
        id: id.to_string(),
        currency: Currency::Btc,
        private_key: private_key.into(),
        their_public_key,
        amount,
        timeout_block_height,
        lockup_address: String::new(),
        lockup_transaction_id: String::new(),
        transaction_id: String::new(),
        address: fresh_address().to_string(),
        wallet_id: None,
    }
}

/// BTC to BTC chain swap. We lock `from_amount` until `from_timeout` and claim `to_amount`.
pub fn chain_swap(id: &str, from_amount: u64, to_amount: u64, from_timeout: u32) -> ChainSwap {
    let mut swap = ChainSwap {
        id: id.to_string(),
        pair: Pair::new(Currency::Btc, Currency::Btc),
        state: SwapState::Pending,
        error: String::new(),
        status: String::new(),
        created_at: 0,
        accept_zero_conf: false,
        preimage: rand::random::<[u8; 32]>().to_vec(),
        is_auto: false,
        service_fee_percent: Percentage(0.1),
        service_fee: None,
        onchain_fee: None,
        from_data: chain_swap_data(id, from_amount, from_timeout),
        to_data: chain_swap_data(id, to_amount, from_timeout - 100),
    };
    swap.from_data.lockup_address = swap
        .from_tree()
        .unwrap()
        .address(Network::Regtest)
        .to_string();
    swap.to_data.lockup_address = swap
        .to_tree()
        .unwrap()
        .address(Network::Regtest)
        .to_string();
    swap
}

pub fn chain_lockups(user: Option<&str>, server: Option<&str>) -> ChainSwapTransactions {
    let lockup = |txid: &str| ChainSwapLockup {
        transaction: TransactionInfo {
            id: txid.to_string(),
            hex: None,
        },
    };
    ChainSwapTransactions {
        user_lock: user.map(lockup),
        server_lock: server.map(lockup),
    }
}

pub fn funding_address(id: &str, timeout_block_height: u32) -> FundingAddress {
    let (private_key, _) = keypair();
    let (_, counterparty_public_key) = keypair();
    let mut funding_address = FundingAddress {
        id: id.to_string(),
        currency: Currency::Btc,
        address: String::new(),
        timeout_block_height,
        counterparty_public_key,
        private_key: private_key.into(),
        status: "created".to_string(),
        lockup_transaction_id: String::new(),
        swap_id: String::new(),
        created_at: 0,
    };
    funding_address.address = funding_address
        .funding_tree()
        .unwrap()
        .address(Network::Regtest)
        .to_string();
    funding_address
}

/// Whether the first input of `tx` is spent through a script leaf.
pub fn spends_script_path(tx: &Transaction) -> bool {
    tx.input[0].witness.len() > 1
}
