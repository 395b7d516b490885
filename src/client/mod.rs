//! Resilient client for the roomcast wire contract
//!
//! Reconnects with decorrelated-jitter backoff, queues sends while
//! disconnected, keeps the connection honest with a ping/pong watchdog, and
//! refreshes its identity token before every attempt when a provider is
//! configured.

pub mod backoff;

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_PING_INTERVAL_MS,
    DEFAULT_PONG_TIMEOUT_MS, DEFAULT_TOKEN_MAX_RETRIES, DEFAULT_TOKEN_RETRY_DELAY_MS,
};
use crate::core::packet::{Origin, Packet, EVENT_JOIN_ROOM, EVENT_LEAVE_ROOM, EVENT_PING, EVENT_PONG};
use crate::error::{Result, RoomcastError};
use backoff::DecorrelatedJitter;

/// Asynchronous identity-token source, called before every connect attempt
pub type TokenProvider =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct ClientConfig {
    pub url: String,
    pub token: Option<String>,
    pub get_token: Option<TokenProvider>,
    pub auto_reconnect: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// None means retry forever
    pub max_retries: Option<u32>,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub get_token_max_retries: u32,
    pub get_token_retry_delay: Duration,
}

impl ClientConfig {
    /// Defaults merged with overrides: start here, then apply `with_*`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            get_token: None,
            auto_reconnect: true,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_retries: None,
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            pong_timeout: Duration::from_millis(DEFAULT_PONG_TIMEOUT_MS),
            get_token_max_retries: DEFAULT_TOKEN_MAX_RETRIES,
            get_token_retry_delay: Duration::from_millis(DEFAULT_TOKEN_RETRY_DELAY_MS),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_token_provider(mut self, provider: TokenProvider) -> Self {
        self.get_token = Some(provider);
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration, factor: f64) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_liveness(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_token_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.get_token_max_retries = retries;
        self.get_token_retry_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Open,
    PermanentlyClosed,
}

#[derive(Default)]
struct Callbacks {
    open: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    message: Mutex<Option<Arc<dyn Fn(Packet) + Send + Sync>>>,
    error: Mutex<Option<Arc<dyn Fn(String) + Send + Sync>>>,
    close: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    reconnect: Mutex<Option<Arc<dyn Fn(u32, Duration) + Send + Sync>>>,
    auth_failed: Mutex<Option<Arc<dyn Fn(String) + Send + Sync>>>,
}

impl Callbacks {
    fn fire_open(&self) {
        if let Some(f) = self.open.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            f();
        }
    }
    fn fire_message(&self, packet: Packet) {
        if let Some(f) = self.message.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            f(packet);
        }
    }
    fn fire_error(&self, message: String) {
        if let Some(f) = self.error.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            f(message);
        }
    }
    fn fire_close(&self) {
        if let Some(f) = self.close.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            f();
        }
    }
    fn fire_reconnect(&self, attempt: u32, delay: Duration) {
        if let Some(f) = self.reconnect.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            f(attempt, delay);
        }
    }
    fn fire_auth_failed(&self, message: String) {
        if let Some(f) = self
            .auth_failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            f(message);
        }
    }
}

pub struct ReconnectingClient {
    config: ClientConfig,
    /// Namespace path derived from the URL, stamped into outbound packets
    namespace_path: String,
    state: Mutex<ClientState>,
    /// Sends enqueued while disconnected, flushed FIFO on open
    queue: Mutex<VecDeque<Packet>>,
    /// Write half of the current session, present only while Open
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    callbacks: Callbacks,
}

impl ReconnectingClient {
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        let url = Url::parse(&config.url)
            .map_err(|e| RoomcastError::ConfigError(format!("invalid url: {}", e)))?;
        let namespace_path = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(|name| format!("/{}", name))
            .unwrap_or_else(|| "/".to_string());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            namespace_path,
            state: Mutex::new(ClientState::Disconnected),
            queue: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            callbacks: Callbacks::default(),
        }))
    }

    pub fn on_open(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.callbacks.open.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    pub fn on_message(&self, f: impl Fn(Packet) + Send + Sync + 'static) {
        *self.callbacks.message.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(String) + Send + Sync + 'static) {
        *self.callbacks.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    pub fn on_close(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.callbacks.close.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    pub fn on_reconnect(&self, f: impl Fn(u32, Duration) + Send + Sync + 'static) {
        *self.callbacks.reconnect.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(f));
    }

    pub fn on_auth_failed(&self, f: impl Fn(String) + Send + Sync + 'static) {
        *self
            .callbacks
            .auth_failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn queued_count(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Starts the connect/reconnect loop
    pub fn connect(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run().await })
    }

    /// Manual close: terminal, no reconnect
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Sends an application event. While disconnected the packet joins the
    /// FIFO queue and goes out ahead of new sends on the next open.
    pub fn send(&self, event: &str, payload: Value) -> Result<()> {
        if self.state() == ClientState::PermanentlyClosed {
            return Err(RoomcastError::TransportClosed);
        }
        let packet = Packet::new(event, payload, Origin::Client, &self.namespace_path);
        self.send_packet(packet)
    }

    /// Sends an event routed to specific rooms
    pub fn send_to_rooms(&self, rooms: Vec<String>, event: &str, payload: Value) -> Result<()> {
        if self.state() == ClientState::PermanentlyClosed {
            return Err(RoomcastError::TransportClosed);
        }
        let packet =
            Packet::new(event, payload, Origin::Client, &self.namespace_path).with_rooms(rooms);
        self.send_packet(packet)
    }

    fn send_packet(&self, packet: Packet) -> Result<()> {
        if self.state() == ClientState::Open {
            let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = outbound.as_ref() {
                if tx.send(packet.to_json()).is_ok() {
                    return Ok(());
                }
            }
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(packet);
        Ok(())
    }

    pub fn join_room(&self, room: &str) -> Result<()> {
        self.send(EVENT_JOIN_ROOM, json!({ "roomName": room }))
    }

    pub fn leave_room(&self, room: &str) -> Result<()> {
        self.send(EVENT_LEAVE_ROOM, json!({ "roomName": room }))
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = DecorrelatedJitter::new(
            self.config.base_delay,
            self.config.max_delay,
            self.config.backoff_factor,
        );
        let mut attempt: u32 = 0;

        loop {
            if self.is_shutdown() {
                break;
            }
            self.set_state(ClientState::Connecting);

            let token = match self.acquire_token().await {
                Ok(token) => token,
                Err(e) => {
                    // Terminal: the outer reconnect loop must not spin on a
                    // credential source that keeps failing.
                    log::error!("Giving up on token acquisition: {}", e);
                    self.set_state(ClientState::PermanentlyClosed);
                    self.callbacks.fire_auth_failed(e.to_string());
                    return;
                }
            };

            match self.session(token, &mut backoff).await {
                Ok(opened) => {
                    if opened {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    log::warn!("Connect attempt failed: {}", e);
                    self.callbacks.fire_error(e.to_string());
                }
            }

            self.set_state(ClientState::Disconnected);
            self.callbacks.fire_close();

            if self.is_shutdown() || !self.config.auto_reconnect {
                break;
            }
            attempt += 1;
            if let Some(max_retries) = self.config.max_retries {
                if attempt > max_retries {
                    log::warn!("Retry budget ({}) exhausted", max_retries);
                    break;
                }
            }
            let delay = backoff.next();
            self.callbacks.fire_reconnect(attempt, delay);

            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.set_state(ClientState::PermanentlyClosed);
    }

    /// Token provider runs before every attempt, with its own bounded
    /// retries and linear backoff.
    async fn acquire_token(&self) -> Result<Option<String>> {
        let Some(provider) = self.config.get_token.clone() else {
            return Ok(self.config.token.clone());
        };
        let mut last_error = String::new();
        for attempt in 0..=self.config.get_token_max_retries {
            match provider().await {
                Ok(token) => return Ok(Some(token)),
                Err(e) => {
                    log::warn!("Token acquisition attempt {} failed: {}", attempt + 1, e);
                    last_error = e.to_string();
                }
            }
            if attempt < self.config.get_token_max_retries {
                sleep(self.config.get_token_retry_delay * (attempt + 1)).await;
            }
        }
        Err(RoomcastError::TokenAcquisitionFailed(last_error))
    }

    fn build_url(&self, token: Option<String>) -> Result<Url> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| RoomcastError::ConfigError(format!("invalid url: {}", e)))?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", &token);
        }
        Ok(url)
    }

    /// One transport session. Returns Ok(true) if the connection reached
    /// Open before ending, Ok(false)/Err otherwise.
    async fn session(&self, token: Option<String>, backoff: &mut DecorrelatedJitter) -> Result<bool> {
        let url = self.build_url(token)?;
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| RoomcastError::TransportError(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        self.set_state(ClientState::Open);
        backoff.reset();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(out_tx);
        self.callbacks.fire_open();

        // Flush the offline queue in FIFO order before any new sends
        let queued: Vec<Packet> = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for packet in queued {
            if ws_tx.send(WsMessage::Text(packet.to_json())).await.is_err() {
                break;
            }
        }

        let mut ping_timer = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        let mut pong_deadline: Option<Instant> = None;
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            let watchdog = async {
                match pong_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                message = ws_rx.next() => {
                    match message {
                        Some(Ok(message)) => {
                            // Any traffic satisfies the liveness contract
                            pong_deadline = None;
                            match message {
                                WsMessage::Text(text) => match Packet::parse(&text) {
                                    Ok(packet) => match packet.event.as_str() {
                                        EVENT_PING => {
                                            let pong = Packet::new(
                                                EVENT_PONG,
                                                Value::Null,
                                                Origin::Client,
                                                &self.namespace_path,
                                            );
                                            let _ =
                                                ws_tx.send(WsMessage::Text(pong.to_json())).await;
                                        }
                                        EVENT_PONG => {}
                                        _ => self.callbacks.fire_message(packet),
                                    },
                                    Err(e) => {
                                        log::warn!("Dropping malformed server packet: {}", e);
                                    }
                                },
                                WsMessage::Close(_) => break,
                                _ => {}
                            }
                        }
                        Some(Err(e)) => {
                            self.callbacks.fire_error(e.to_string());
                            break;
                        }
                        None => break,
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = Packet::new(
                        EVENT_PING,
                        Value::Null,
                        Origin::Client,
                        &self.namespace_path,
                    );
                    if ws_tx.send(WsMessage::Text(ping.to_json())).await.is_err() {
                        break;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }
                _ = watchdog => {
                    // No pong, no traffic: the transport is dead from where
                    // we stand. Force-close and re-enter the reconnect path.
                    self.callbacks.fire_error("pong timeout".to_string());
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = shutdown.changed() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }

        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(true)
    }
}
