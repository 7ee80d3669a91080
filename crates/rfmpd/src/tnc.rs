//! TNC connector: TCP to a KISS host.
//!
//! Maintains one connection to the TNC (Direwolf or compatible), feeding
//! received bytes through the KISS decoder and dispatching AX.25 UI frames
//! to the orchestrator. State machine is Disconnected -> Connecting ->
//! Connected -> Disconnected with reconnect attempts spaced by the
//! configured interval. Offline mode skips connection entirely: sends are
//! no-ops and ingest is silent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rfmp_proto::ax25::{Ax25Address, Ax25Frame};
use rfmp_proto::kiss::{KissDecoder, KissFrame};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct TncConfig {
    /// KISS host.
    pub host: String,
    /// KISS port.
    pub port: u16,
    /// Pause between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Skip the TNC entirely.
    pub offline_mode: bool,
}

/// Events delivered to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TncEvent {
    /// The TCP connection came up.
    Connected,
    /// The TCP connection went down; reconnect is already scheduled.
    Disconnected,
    /// A decoded AX.25 UI frame arrived.
    Frame(Ax25Frame),
}

/// Handle to the running connector.
///
/// Frames to transmit go in through [`TncConnector::send_frame`]; decoded UI
/// frames and connection transitions come out of the event receiver returned
/// by [`TncConnector::start`].
pub struct TncConnector {
    offline: bool,
    outgoing: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
    // Keeps the event channel open when no connection task runs (offline).
    _events: mpsc::Sender<TncEvent>,
}

impl TncConnector {
    /// Spawn the connection task and return the handle plus the event
    /// stream.
    ///
    /// `source` is the local AX.25 address used for outbound UI frames; it
    /// is read per-send so callsign changes take effect immediately.
    #[must_use]
    pub fn start(
        config: TncConfig,
        source: Arc<RwLock<Ax25Address>>,
    ) -> (Self, mpsc::Receiver<TncEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        let connected = Arc::new(AtomicBool::new(false));

        let abort = if config.offline_mode {
            tracing::info!("offline mode: not connecting to TNC");
            None
        } else {
            let task = tokio::spawn(run_connection(
                config.clone(),
                source,
                outgoing_rx,
                events_tx.clone(),
                Arc::clone(&connected),
            ));
            Some(task.abort_handle())
        };

        (
            Self {
                offline: config.offline_mode,
                outgoing: outgoing_tx,
                connected,
                abort,
                _events: events_tx,
            },
            events_rx,
        )
    }

    /// Queue an RFMP payload for transmission.
    ///
    /// A no-op in offline mode. While disconnected the frame is dropped
    /// with a warning, matching the lossy medium: the store-level queue is
    /// the retry mechanism, not this buffer.
    pub async fn send_frame(&self, payload: Vec<u8>) {
        if self.offline {
            tracing::debug!("offline mode: frame not sent");
            return;
        }
        if !self.is_connected() {
            tracing::warn!("not connected to TNC, frame dropped");
            return;
        }
        if self.outgoing.send(payload).await.is_err() {
            tracing::warn!("connector task gone, frame dropped");
        }
    }

    /// Whether the TCP connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Stop the connection task. Idempotent.
    pub fn stop(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        self.connected.store(false, Ordering::Release);
    }
}

/// Reconnect loop: one iteration per connection lifetime.
async fn run_connection(
    config: TncConfig,
    source: Arc<RwLock<Ax25Address>>,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<TncEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        tracing::info!(host = %config.host, port = config.port, "connecting to TNC");

        let stream = match TcpStream::connect((config.host.as_str(), config.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in = ?config.reconnect_interval,
                    "TNC connection failed"
                );
                tokio::time::sleep(config.reconnect_interval).await;
                continue;
            }
        };

        tracing::info!("connected to TNC");
        connected.store(true, Ordering::Release);
        if events.send(TncEvent::Connected).await.is_err() {
            return;
        }

        serve_connection(stream, &source, &mut outgoing, &events).await;

        connected.store(false, Ordering::Release);
        tracing::warn!("disconnected from TNC");
        if events.send(TncEvent::Disconnected).await.is_err() {
            return;
        }

        tokio::time::sleep(config.reconnect_interval).await;
    }
}

/// Pump one live connection until an I/O error or EOF.
async fn serve_connection(
    stream: TcpStream,
    source: &Arc<RwLock<Ax25Address>>,
    outgoing: &mut mpsc::Receiver<Vec<u8>>,
    events: &mpsc::Sender<TncEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = KissDecoder::new();
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("TNC closed the connection");
                    return;
                }
                Ok(n) => {
                    for kiss in decoder.extend(&buf[..n]) {
                        match Ax25Frame::decode(&kiss.data) {
                            Ok(frame) if frame.is_ui() => {
                                if events.send(TncEvent::Frame(frame)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => tracing::trace!("ignoring non-UI AX.25 frame"),
                            Err(e) => tracing::debug!(error = %e, "bad AX.25 frame dropped"),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "TNC read error");
                    return;
                }
            },
            payload = outgoing.recv() => {
                let Some(payload) = payload else { return };

                let from = source.read().await.clone();
                let frame = Ax25Frame::ui(from, broadcast_destination(), payload);
                let wire = KissFrame::data(0, frame.encode()).encode();

                if let Err(e) = writer.write_all(&wire).await {
                    tracing::warn!(error = %e, "TNC write error");
                    return;
                }
            }
        }
    }
}

fn broadcast_destination() -> Ax25Address {
    // The constant is a valid callsign; construction cannot fail.
    Ax25Address::new(rfmp_proto::RFMP_DESTINATION, 0)
        .unwrap_or_else(|_| unreachable!("RFMP destination is a valid address"))
}
