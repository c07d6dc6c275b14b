//! Persistent push socket to the remote
//!
//! The socket authenticates with the `API-KEY` header, subscribes to the
//! configured event channels after every (re)connect and folds incoming
//! messages into a [`RemoteState`] cache. Lost connections are retried with
//! exponential backoff; each successful reconnect after the first connect
//! notifies the registered resume observers so they can refresh data the
//! remote may have changed while it was asleep.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::update::{RemoteState, RemoteUpdate, RemoteUpdateType};
use crate::{RemoteError, Result};

/// Channel subscribed when none is configured
pub const DEFAULT_CHANNEL: &str = "software_updates";

/// Observer called after the socket came back from a disconnect
pub type ResumeCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

type Stream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: String,
    pub api_key: String,
    pub channels: Vec<String>,
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Ceiling for the reconnect delay
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the current delay
    pub jitter_factor: f64,
}

impl SocketConfig {
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            channels: vec![DEFAULT_CHANNEL.to_string()],
            initial_delay: Duration::from_secs(1),
            max_delay: Self::DEFAULT_MAX_DELAY,
            jitter_factor: 0.1,
        }
    }

    #[must_use]
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    ///
    /// `jitter` is a sample from `[0, 1)`. The result never exceeds
    /// `max_delay`.
    pub fn reconnect_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        let extra = base.mul_f64(self.jitter_factor * jitter.clamp(0.0, 1.0));
        (base + extra).min(self.max_delay)
    }
}

pub struct RemoteEventSocket {
    config: SocketConfig,
    state: RwLock<RemoteState>,
    updates: broadcast::Sender<RemoteUpdateType>,
    resume_observers: Mutex<Vec<ResumeCallback>>,
    shutdown: watch::Sender<bool>,
}

impl RemoteEventSocket {
    pub fn new(config: SocketConfig) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            state: RwLock::new(RemoteState::default()),
            updates,
            resume_observers: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Register an observer run after every reconnect
    pub fn on_resume(&self, callback: ResumeCallback) {
        self.resume_observers.lock().push(callback);
    }

    /// Snapshot of the attribute cache
    pub fn state(&self) -> RemoteState {
        self.state.read().clone()
    }

    /// Receive the kind of every cache update
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteUpdateType> {
        self.updates.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Fold a raw message into the cache
    pub fn handle_message(&self, text: &str) -> Option<RemoteUpdateType> {
        let update = RemoteUpdate::parse(text)?;
        let kind = self.state.write().apply(update);
        debug!(?kind, "Remote attributes updated");
        let _ = self.updates.send(kind);
        Some(kind)
    }

    /// Run the connection loop until [`shutdown`](Self::shutdown) is called
    ///
    /// A socket that was shut down can be spawned again.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.shutdown.send_replace(false);
        let socket = Arc::clone(self);
        tokio::spawn(async move { socket.run().await })
    }

    async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut first = true;
        let mut attempt: u32 = 0;

        while !*shutdown.borrow() {
            match self.connect().await {
                Ok(stream) => {
                    info!(url = %self.config.url, "Remote socket connected");
                    if !first {
                        self.notify_resumed();
                    }
                    first = false;
                    attempt = 0;
                    if self.serve(stream, &mut shutdown).await {
                        return;
                    }
                    debug!("Remote socket closed, reconnecting");
                }
                Err(e) => warn!(url = %self.config.url, error = %e, "Remote socket connect failed"),
            }

            let delay = self.config.reconnect_delay(attempt, rand::random::<f64>());
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Remote socket loop stopped");
    }

    async fn connect(&self) -> Result<Stream> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let api_key = HeaderValue::from_str(&self.config.api_key)
            .map_err(|e| RemoteError::Header(e.to_string()))?;
        request.headers_mut().insert("API-KEY", api_key);
        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    /// Serve one connection; returns true when asked to shut down
    async fn serve(&self, stream: Stream, shutdown: &mut watch::Receiver<bool>) -> bool {
        let (mut write, mut read) = stream.split();

        let subscribe = json!({
            "id": 1,
            "kind": "req",
            "msg": "subscribe_events",
            "msg_data": {"channels": self.config.channels},
        });
        if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
            warn!(error = %e, "Failed to subscribe to remote events");
            return false;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.close().await;
                    return true;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_message(&text);
                    }
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Remote socket read failed");
                        return false;
                    }
                }
            }
        }
    }

    fn notify_resumed(&self) {
        let observers = self.resume_observers.lock().clone();
        for observer in observers {
            tokio::spawn(observer());
        }
    }
}
