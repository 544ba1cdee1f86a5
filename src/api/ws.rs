//! Reconnecting websocket client for counterparty status pushes.
//!
//! The [`EventChannel`] keeps one websocket open while at least one swap or funding address is
//! subscribed. A reader thread per connection dispatches frames, sends keepalive pings and, once
//! the connection dies, reconnects in a loop. Every (re)connect resubscribes all tracked ids before
//! it returns, so coverage has no gaps across reconnects.

use std::{
    io::ErrorKind,
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::{json, Value};
use tungstenite::{stream::MaybeTlsStream, Message, WebSocket};

use super::{error::ApiError, FundingUpdate, SwapStatusUpdate};

#[cfg(not(feature = "integration-test"))]
const PING_INTERVAL: Duration = Duration::from_secs(30);
#[cfg(not(feature = "integration-test"))]
const PONG_WAIT: Duration = Duration::from_secs(5);
#[cfg(not(feature = "integration-test"))]
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(not(feature = "integration-test"))]
const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

#[cfg(feature = "integration-test")]
const PING_INTERVAL: Duration = Duration::from_secs(2);
#[cfg(feature = "integration-test")]
const PONG_WAIT: Duration = Duration::from_secs(1);
#[cfg(feature = "integration-test")]
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(2);
#[cfg(feature = "integration-test")]
const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// How long a read blocks before the reader releases the socket to writers.
const READ_TICK: Duration = Duration::from_millis(200);
const SLEEP_CHUNK: Duration = Duration::from_millis(100);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Channels of the counterparty websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsChannel {
    /// Swap status updates.
    SwapUpdate,
    /// Funding address updates.
    FundingUpdate,
}

impl WsChannel {
    fn as_str(&self) -> &'static str {
        match self {
            WsChannel::SwapUpdate => "swap.update",
            WsChannel::FundingUpdate => "funding.update",
        }
    }
}

#[derive(Deserialize)]
struct WsFrame {
    #[serde(default)]
    event: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    args: Vec<Value>,
}

struct Inner {
    url: String,
    conn: Mutex<Option<Socket>>,
    generation: AtomicU64,
    swap_ids: Mutex<Vec<String>>,
    funding_ids: Mutex<Vec<String>>,
    /// Serializes connects and subscribes.
    subscribe_lock: Mutex<()>,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_interval: Duration,
    updates_tx: Mutex<Option<Sender<SwapStatusUpdate>>>,
    funding_tx: Mutex<Option<Sender<FundingUpdate>>>,
    ack_tx: Mutex<Sender<()>>,
    ack_rx: Mutex<Receiver<()>>,
}

/// Duplex connection to the counterparty pushing swap and funding updates.
pub struct EventChannel {
    inner: Arc<Inner>,
    updates_rx: Mutex<Option<Receiver<SwapStatusUpdate>>>,
    funding_rx: Mutex<Option<Receiver<FundingUpdate>>>,
}

/// Websocket URL of the counterparty at `api_url`.
pub fn websocket_url(api_url: &str) -> Result<String, ApiError> {
    let api_url = api_url.trim_end_matches('/');
    let url = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if api_url.starts_with("ws://") || api_url.starts_with("wss://") {
        api_url.to_string()
    } else {
        return Err(ApiError::InvalidUrl(api_url.to_string()));
    };
    Ok(format!("{url}/v2/ws"))
}

impl EventChannel {
    /// Creates an unconnected channel for the counterparty at `api_url`.
    pub fn new(api_url: &str) -> Result<Self, ApiError> {
        Self::with_reconnect_interval(api_url, RECONNECT_INTERVAL)
    }

    /// Like [`EventChannel::new`] with a custom delay between reconnect attempts.
    pub fn with_reconnect_interval(
        api_url: &str,
        reconnect_interval: Duration,
    ) -> Result<Self, ApiError> {
        let (updates_tx, updates_rx) = mpsc::channel();
        let (funding_tx, funding_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        Ok(Self {
            inner: Arc::new(Inner {
                url: websocket_url(api_url)?,
                conn: Mutex::new(None),
                generation: AtomicU64::new(0),
                swap_ids: Mutex::new(Vec::new()),
                funding_ids: Mutex::new(Vec::new()),
                subscribe_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                reconnect_interval,
                updates_tx: Mutex::new(Some(updates_tx)),
                funding_tx: Mutex::new(Some(funding_tx)),
                ack_tx: Mutex::new(ack_tx),
                ack_rx: Mutex::new(ack_rx),
            }),
            updates_rx: Mutex::new(Some(updates_rx)),
            funding_rx: Mutex::new(Some(funding_rx)),
        })
    }

    /// Takes the swap status queue. Returns `None` after the first call.
    pub fn take_updates(&self) -> Option<Receiver<SwapStatusUpdate>> {
        self.updates_rx.lock().ok()?.take()
    }

    /// Takes the funding update queue. Returns `None` after the first call.
    pub fn take_funding_updates(&self) -> Option<Receiver<FundingUpdate>> {
        self.funding_rx.lock().ok()?.take()
    }

    /// Connects unless already connected, resubscribing every tracked id.
    pub fn connect(&self) -> Result<(), ApiError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ApiError::Closed);
        }
        let _guard = self.inner.subscribe_lock.lock()?;
        if self.inner.conn.lock()?.is_some() {
            return Ok(());
        }
        Inner::connect_locked(&self.inner)
    }

    /// Drops the current connection and connects again.
    pub fn reconnect(&self) -> Result<(), ApiError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ApiError::Closed);
        }
        let _guard = self.inner.subscribe_lock.lock()?;
        Inner::reconnect_locked(&self.inner)
    }

    /// Whether a socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .conn
            .lock()
            .map(|conn| conn.is_some())
            .unwrap_or(false)
    }

    /// Subscribes to status updates of `ids`.
    pub fn subscribe(&self, ids: &[String]) -> Result<(), ApiError> {
        self.subscribe_channel(WsChannel::SwapUpdate, ids)
    }

    /// Subscribes to updates of the funding addresses `ids`.
    pub fn subscribe_funding(&self, ids: &[String]) -> Result<(), ApiError> {
        self.subscribe_channel(WsChannel::FundingUpdate, ids)
    }

    fn subscribe_channel(&self, channel: WsChannel, ids: &[String]) -> Result<(), ApiError> {
        if ids.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ApiError::Closed);
        }
        log::info!("Subscribing to {}: {ids:?}", channel.as_str());

        let _guard = inner.subscribe_lock.lock()?;
        if inner.conn.lock()?.is_none() {
            Inner::connect_locked(inner)?;
        }
        if let Err(e) = inner.subscribe_raw(channel, ids) {
            log::warn!("Subscribe failed, forcing reconnect: {e}");
            Inner::reconnect_locked(inner)?;
            inner.subscribe_raw(channel, ids)?;
        }

        let mut tracked = inner.ids(channel).lock()?;
        for id in ids {
            if !tracked.contains(id) {
                tracked.push(id.clone());
            }
        }
        Ok(())
    }

    /// Stops tracking swap `id`. Disconnects once nothing is tracked anymore.
    pub fn unsubscribe(&self, id: &str) {
        self.unsubscribe_channel(WsChannel::SwapUpdate, id)
    }

    /// Stops tracking funding address `id`. Disconnects once nothing is tracked anymore.
    pub fn unsubscribe_funding(&self, id: &str) {
        self.unsubscribe_channel(WsChannel::FundingUpdate, id)
    }

    fn unsubscribe_channel(&self, channel: WsChannel, id: &str) {
        let inner = &self.inner;
        if let Ok(mut ids) = inner.ids(channel).lock() {
            ids.retain(|tracked| tracked != id);
        }
        log::debug!("Unsubscribed {id} from {}", channel.as_str());

        if inner.tracks_nothing() {
            log::debug!("Nothing left to track, disconnecting websocket");
            inner.disconnect();
        }
    }

    /// Closes the channel for good. Idempotent; ends both update queues.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing websocket");
        if let Ok(mut tx) = self.inner.updates_tx.lock() {
            tx.take();
        }
        if let Ok(mut tx) = self.inner.funding_tx.lock() {
            tx.take();
        }
        self.inner.disconnect();
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn ids(&self, channel: WsChannel) -> &Mutex<Vec<String>> {
        match channel {
            WsChannel::SwapUpdate => &self.swap_ids,
            WsChannel::FundingUpdate => &self.funding_ids,
        }
    }

    fn tracks_nothing(&self) -> bool {
        let swaps = self.swap_ids.lock().map(|ids| ids.is_empty()).unwrap_or(true);
        let funding = self.funding_ids.lock().map(|ids| ids.is_empty()).unwrap_or(true);
        swaps && funding
    }

    fn disconnect(&self) {
        let socket = match self.conn.lock() {
            Ok(mut conn) => conn.take(),
            Err(_) => None,
        };
        if let Some(mut socket) = socket {
            if let Err(e) = socket.close(None).and_then(|_| socket.flush()) {
                log::debug!("Could not close websocket cleanly: {e}");
            }
        }
    }

    /// Opens a socket, starts its reader and resubscribes tracked ids. Caller holds `subscribe_lock`.
    fn connect_locked(inner: &Arc<Inner>) -> Result<(), ApiError> {
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ApiError::Closed);
        }
        let (socket, _) = tungstenite::connect(inner.url.as_str())?;
        match socket.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(READ_TICK))?,
            MaybeTlsStream::Rustls(stream) => stream.get_ref().set_read_timeout(Some(READ_TICK))?,
            _ => log::warn!("Unknown websocket stream, keepalive may be delayed"),
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.conn.lock()? = Some(socket);
        log::info!("Connected to websocket at {}", inner.url);

        let reader = inner.clone();
        thread::Builder::new()
            .name("Event channel reader".to_string())
            .spawn(move || reader.run_reader(generation))?;

        for channel in [WsChannel::SwapUpdate, WsChannel::FundingUpdate] {
            let ids = inner.ids(channel).lock()?.clone();
            if !ids.is_empty() {
                log::info!("Resubscribing to {}: {ids:?}", channel.as_str());
                inner.subscribe_raw(channel, &ids)?;
            }
        }
        Ok(())
    }

    /// Caller holds `subscribe_lock`.
    fn reconnect_locked(inner: &Arc<Inner>) -> Result<(), ApiError> {
        log::info!("Force reconnecting websocket");
        inner.disconnect();
        Inner::connect_locked(inner)
    }

    /// Sends a subscribe frame and waits for the acknowledgement.
    fn subscribe_raw(&self, channel: WsChannel, ids: &[String]) -> Result<(), ApiError> {
        let ack_rx = self.ack_rx.lock()?;
        while ack_rx.try_recv().is_ok() {}

        let frame = json!({
            "op": "subscribe",
            "channel": channel.as_str(),
            "args": ids,
        });
        {
            let mut conn = self.conn.lock()?;
            let socket = conn.as_mut().ok_or(ApiError::NotConnected)?;
            socket.send(Message::text(frame.to_string()))?;
        }

        match ack_rx.recv_timeout(SUBSCRIBE_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(ApiError::SubscribeTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(ApiError::Closed),
        }
    }

    fn run_reader(self: Arc<Self>, generation: u64) {
        let err = match self.read_loop(generation) {
            Ok(()) => return,
            Err(e) => e,
        };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let ours = match self.conn.lock() {
            Ok(mut conn) if self.generation.load(Ordering::SeqCst) == generation => {
                conn.take();
                true
            }
            _ => false,
        };
        if !ours {
            return;
        }
        if self.tracks_nothing() {
            log::debug!("Websocket dropped while idle: {err}");
            return;
        }

        log::error!(
            "Lost connection to websocket: {err}, reconnecting in {:?}",
            self.reconnect_interval
        );
        self.reconnect_loop();
    }

    fn read_loop(&self, generation: u64) -> Result<(), ApiError> {
        let mut last_ping = Instant::now();
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let message = {
                let mut conn = self.conn.lock()?;
                if self.generation.load(Ordering::SeqCst) != generation {
                    return Ok(());
                }
                let Some(socket) = conn.as_mut() else {
                    return Ok(());
                };

                if let Some(sent) = awaiting_pong {
                    if sent.elapsed() > PONG_WAIT {
                        return Err(std::io::Error::new(
                            ErrorKind::TimedOut,
                            "no pong received",
                        )
                        .into());
                    }
                } else if last_ping.elapsed() >= PING_INTERVAL {
                    socket.send(Message::Ping(Vec::<u8>::new().into()))?;
                    last_ping = Instant::now();
                    awaiting_pong = Some(last_ping);
                }

                socket.read()
            };

            match message {
                Ok(Message::Text(text)) => self.dispatch(text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.dispatch(text),
                    Err(e) => log::warn!("Dropping binary websocket frame: {e}"),
                },
                Ok(Message::Pong(_)) => {
                    log::trace!("Received pong");
                    awaiting_pong = None;
                }
                Ok(Message::Close(frame)) => {
                    return Err(ApiError::Counterparty(format!(
                        "websocket closed by counterparty: {frame:?}"
                    )));
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    // Let writers at the socket.
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch(&self, text: &str) {
        log::trace!("Received websocket message: {text}");
        if let Err(e) = self.handle_text(text) {
            log::error!("Could not handle websocket message: {e}");
        }
    }

    fn handle_text(&self, text: &str) -> Result<(), ApiError> {
        let frame: WsFrame = serde_json::from_str(text)?;
        if let Some(error) = frame.error {
            return Err(ApiError::Counterparty(error));
        }

        match (frame.event.as_str(), frame.channel.as_str()) {
            ("update", "swap.update") => {
                let tx = self.updates_tx.lock()?;
                for arg in frame.args {
                    let update: SwapStatusUpdate = serde_json::from_value(arg)?;
                    if let Some(tx) = tx.as_ref() {
                        if tx.send(update).is_err() {
                            log::debug!("Swap update queue is gone");
                        }
                    }
                }
            }
            ("update", "funding.update") => {
                let tx = self.funding_tx.lock()?;
                for arg in frame.args {
                    let update: FundingUpdate = serde_json::from_value(arg)?;
                    if let Some(tx) = tx.as_ref() {
                        if tx.send(update).is_err() {
                            log::debug!("Funding update queue is gone");
                        }
                    }
                }
            }
            ("update", channel) => log::warn!("Unknown update channel: {channel}"),
            ("subscribe", _) => {
                if self.ack_tx.lock()?.send(()).is_err() {
                    log::debug!("Subscription ack queue is gone");
                }
            }
            (event, _) => log::warn!("Unknown websocket event: {event}"),
        }
        Ok(())
    }

    fn reconnect_loop(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let started = Instant::now();
            while started.elapsed() < self.reconnect_interval {
                if self.closed.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(SLEEP_CHUNK);
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            let Ok(_guard) = self.subscribe_lock.lock() else {
                break;
            };
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match self.conn.lock() {
                Ok(conn) if conn.is_some() => break,
                Ok(_) => {}
                Err(_) => break,
            }
            if self.tracks_nothing() {
                break;
            }
            match Inner::connect_locked(self) {
                Ok(()) => break,
                Err(e) => log::error!(
                    "Could not reconnect websocket: {e}, retrying in {:?}",
                    self.reconnect_interval
                ),
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}
