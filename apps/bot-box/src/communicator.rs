//! Reconnecting signaling client.
//!
//! One task owns the socket. It dials with the `x-public-key` header, pushes
//! every inbound text frame to the orchestrator verbatim, writes outbound
//! frames, and pings on a fixed interval. Any I/O error or a missing pong is
//! treated as connection loss: the task reports `Disconnected`, waits the
//! reconnect backoff and dials again, forever.
//!
//! Outbound frames are only accepted while the link reports `Connected`.
//! Frames offered at any other time are dropped, and frames still queued when
//! a connection dies are discarded before the next connection is announced,
//! so nothing crosses a reconnect.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::Settings;

const TARGET: &str = "bot_box::communicator";
const OUTBOUND_CAPACITY: usize = 256;
const PONG_GRACE_FACTOR: u32 = 3;

pub const PUBLIC_KEY_HEADER: &str = "x-public-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum CommunicatorError {
    #[error("public key is not a valid header value: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("invalid signaling url: {0}")]
    Request(#[from] tungstenite::Error),
}

#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    pub url: Url,
    pub public_key: String,
    pub reconnect: Duration,
    pub ping_interval: Duration,
    pub send_timeout: Duration,
}

impl CommunicatorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            url: settings.srv_url.clone(),
            public_key: settings.public_key.clone(),
            reconnect: settings.timing.reconnect,
            ping_interval: settings.timing.ping_interval,
            send_timeout: settings.timing.send_timeout,
        }
    }
}

/// Fire-and-forget access to the signaling link.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<String>,
    status: watch::Receiver<LinkStatus>,
}

impl SignalingSender {
    pub fn from_parts(tx: mpsc::Sender<String>, status: watch::Receiver<LinkStatus>) -> Self {
        Self { tx, status }
    }

    /// Queues a frame for the current connection. Returns `false` if it was dropped.
    pub fn send(&self, frame: String) -> bool {
        let status = *self.status.borrow();
        if status != LinkStatus::Connected {
            debug!(target: TARGET, ?status, "signaling link down; dropping frame");
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: TARGET, "signaling send queue full; dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: TARGET, "signaling task stopped; dropping frame");
                false
            }
        }
    }
}

pub struct CommunicatorHandle {
    pub sender: SignalingSender,
    pub status: watch::Receiver<LinkStatus>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CommunicatorHandle {
    /// Splits off the parts the orchestrator consumes, keeping the shutdown control.
    pub fn into_parts(self) -> (SignalingParts, CommunicatorShutdown) {
        (
            SignalingParts {
                sender: self.sender,
                status: self.status,
                inbound: self.inbound,
            },
            CommunicatorShutdown {
                shutdown: self.shutdown,
                task: self.task,
            },
        )
    }

    pub async fn shutdown(self) {
        let (_, shutdown) = self.into_parts();
        shutdown.shutdown().await;
    }
}

pub struct SignalingParts {
    pub sender: SignalingSender,
    pub status: watch::Receiver<LinkStatus>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Dropping this without calling `shutdown` also stops the signaling task.
pub struct CommunicatorShutdown {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CommunicatorShutdown {
    /// Sends a close frame on the live connection, if any, and waits for the task to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(target: TARGET, error = %err, "signaling task ended abnormally");
        }
    }
}

pub struct Communicator;

impl Communicator {
    pub fn spawn(config: CommunicatorConfig) -> Result<CommunicatorHandle, CommunicatorError> {
        let header = HeaderValue::from_str(&config.public_key)?;
        // Validate the url up front so the dial loop only sees network failures.
        config.url.as_str().into_client_request()?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let link = Link {
            config,
            header,
            outbound: outbound_rx,
            inbound: inbound_tx,
            status: status_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(link.run());

        Ok(CommunicatorHandle {
            sender: SignalingSender::from_parts(outbound_tx, status_rx.clone()),
            status: status_rx,
            inbound: inbound_rx,
            shutdown: shutdown_tx,
            task,
        })
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Link {
    config: CommunicatorConfig,
    header: HeaderValue,
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::UnboundedSender<String>,
    status: watch::Sender<LinkStatus>,
    shutdown: watch::Receiver<bool>,
}

impl Link {
    async fn run(mut self) {
        loop {
            if self.stopping() {
                break;
            }
            self.status.send_replace(LinkStatus::Connecting);
            debug!(target: TARGET, url = %self.config.url, "dialing signaling server");

            let dialed = tokio::select! {
                result = dial(&self.config.url, &self.header) => result,
                _ = self.shutdown.changed() => break,
            };

            match dialed {
                Ok(stream) => {
                    let stale = self.discard_stale();
                    if stale > 0 {
                        debug!(target: TARGET, stale, "discarded frames queued for the previous connection");
                    }
                    self.status.send_replace(LinkStatus::Connected);
                    info!(target: TARGET, url = %self.config.url, "signaling connected");

                    let end = self.session(stream).await;
                    self.status.send_replace(LinkStatus::Disconnected);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!(target: TARGET, %reason, "signaling connection lost");
                        }
                    }
                }
                Err(err) => {
                    self.status.send_replace(LinkStatus::Disconnected);
                    warn!(target: TARGET, error = %err, "signaling dial failed");
                }
            }

            tokio::select! {
                _ = sleep(self.config.reconnect) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.status.send_replace(LinkStatus::Disconnected);
        debug!(target: TARGET, "signaling task stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn discard_stale(&mut self) -> usize {
        let mut count = 0;
        while self.outbound.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut sink, mut source) = stream.split();
        let period = self.config.ping_interval;
        let grace = period * PONG_GRACE_FACTOR;
        let send_timeout = self.config.send_timeout;

        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let pong_deadline = sleep(grace);
        tokio::pin!(pong_deadline);

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        trace!(target: TARGET, len = text.len(), "ws in");
                        let _ = self.inbound.send(text);
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            let _ = self.inbound.send(text);
                        }
                        Err(err) => debug!(target: TARGET, error = %err, "ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline.as_mut().reset(Instant::now() + grace);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by server: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                    None => return SessionEnd::Lost("stream ended".into()),
                },
                Some(frame) = self.outbound.recv() => {
                    match timeout(send_timeout, sink.send(Message::Text(frame))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return SessionEnd::Lost(err.to_string()),
                        Err(_) => return SessionEnd::Lost("send timed out".into()),
                    }
                }
                _ = ping.tick() => {
                    match timeout(send_timeout, sink.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => trace!(target: TARGET, "ping"),
                        Ok(Err(err)) => return SessionEnd::Lost(format!("ping failed: {err}")),
                        Err(_) => return SessionEnd::Lost("ping timed out".into()),
                    }
                }
                _ = &mut pong_deadline => {
                    let _ = sink.close().await;
                    return SessionEnd::Lost("no pong within deadline".into());
                }
                _ = self.shutdown.changed() => {
                    let _ = timeout(send_timeout, sink.send(Message::Close(None))).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn dial(url: &Url, header: &HeaderValue) -> Result<WsStream, tungstenite::Error> {
    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(PUBLIC_KEY_HEADER, header.clone());
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}
