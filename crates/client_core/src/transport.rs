use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the socket on purpose.
    ServerClosed,
    Network,
    /// Local teardown.
    ClientClosed,
}

impl DisconnectReason {
    pub fn is_server_forced(&self) -> bool {
        matches!(self, Self::ServerClosed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Reconnected { attempt: u32 },
    Disconnected { reason: DisconnectReason },
    ConnectError(String),
    Server(ServerEvent),
}

/// The wire. Only the connection manager holds one.
pub trait Transport: Send + Sync {
    /// Starts connecting; progress is reported as `TransportEvent`s.
    fn open(&mut self, endpoint: &str) -> Result<(), SyncError>;
    fn send(&mut self, request: &ClientRequest) -> Result<(), SyncError>;
    fn is_connected(&self) -> bool;
    /// Skips any pending backoff delay.
    fn reconnect_now(&mut self);
    fn close(&mut self);
}

/// Bounded exponential backoff: `min * 2^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5))
    }
}

#[derive(Debug)]
enum DriverControl {
    ReconnectNow,
    Shutdown,
}

/// Websocket transport: a driver task owns the socket and retries forever.
pub struct WsTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    backoff: Backoff,
    connected: Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    control: Option<mpsc::UnboundedSender<DriverControl>>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>, backoff: Backoff) -> Self {
        Self {
            events,
            backoff,
            connected: Arc::new(AtomicBool::new(false)),
            outbound: None,
            control: None,
            task: None,
        }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, endpoint: &str) -> Result<(), SyncError> {
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(SyncError::Transport(format!(
                "websocket endpoint must start with ws:// or wss://: {endpoint}"
            )));
        }
        self.close();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            endpoint.to_string(),
            self.events.clone(),
            outbound_rx,
            control_rx,
            Arc::clone(&self.connected),
            self.backoff,
        ));
        self.outbound = Some(outbound_tx);
        self.control = Some(control_tx);
        self.task = Some(task);
        Ok(())
    }

    fn send(&mut self, request: &ClientRequest) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::Transport("websocket is not connected".into()));
        }
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| SyncError::Transport("websocket was never opened".into()))?;
        outbound
            .send(request.clone())
            .map_err(|_| SyncError::Transport("websocket driver has stopped".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect_now(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(DriverControl::ReconnectNow);
        }
    }

    fn close(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(DriverControl::Shutdown);
        }
        self.outbound = None;
        if let Some(task) = self.task.take() {
            // The driver exits on Shutdown; abort covers a connect stuck in DNS/TLS.
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientRequest>,
    mut control_rx: mpsc::UnboundedReceiver<DriverControl>,
    connected: Arc<AtomicBool>,
    mut backoff: Backoff,
) {
    let mut ever_connected = false;
    let mut attempt: u32 = 0;

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                connected.store(true, Ordering::SeqCst);
                backoff.reset();
                let event = if ever_connected {
                    TransportEvent::Reconnected { attempt }
                } else {
                    TransportEvent::Connected
                };
                ever_connected = true;
                attempt = 0;
                if events.send(event).is_err() {
                    return;
                }
                info!(url = %url, "transport: websocket connected");

                let (mut writer, mut reader) = ws_stream.split();
                let reason = loop {
                    tokio::select! {
                        frame = reader.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        if events.send(TransportEvent::Server(event)).is_err() {
                                            break DisconnectReason::ClientClosed;
                                        }
                                    }
                                    Err(err) => {
                                        warn!(%err, "transport: dropping undecodable server frame")
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) => break DisconnectReason::ServerClosed,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(%err, "transport: websocket receive failed");
                                break DisconnectReason::Network;
                            }
                            None => break DisconnectReason::Network,
                        },
                        request = outbound_rx.recv() => match request {
                            Some(request) => {
                                let text = match serde_json::to_string(&request) {
                                    Ok(text) => text,
                                    Err(err) => {
                                        warn!(
                                            %err,
                                            kind = request.kind(),
                                            "transport: failed to encode request"
                                        );
                                        continue;
                                    }
                                };
                                if let Err(err) = writer.send(WsMessage::Text(text)).await {
                                    warn!(%err, "transport: websocket send failed");
                                    break DisconnectReason::Network;
                                }
                            }
                            None => {
                                let _ = writer.close().await;
                                break DisconnectReason::ClientClosed;
                            }
                        },
                        control = control_rx.recv() => match control {
                            Some(DriverControl::ReconnectNow) => {}
                            Some(DriverControl::Shutdown) | None => {
                                let _ = writer.close().await;
                                break DisconnectReason::ClientClosed;
                            }
                        },
                    }
                };

                connected.store(false, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Disconnected { reason });
                if reason == DisconnectReason::ClientClosed {
                    return;
                }
            }
            Err(err) => {
                debug!(%err, attempt, "transport: connect attempt failed");
                if events
                    .send(TransportEvent::ConnectError(err.to_string()))
                    .is_err()
                {
                    return;
                }
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            control = control_rx.recv() => match control {
                Some(DriverControl::ReconnectNow) => {
                    debug!("transport: reconnecting without backoff");
                }
                Some(DriverControl::Shutdown) | None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_never_overflows() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }

    #[test]
    fn only_server_close_is_forced() {
        assert!(DisconnectReason::ServerClosed.is_server_forced());
        assert!(!DisconnectReason::Network.is_server_forced());
        assert!(!DisconnectReason::ClientClosed.is_server_forced());
    }

    #[tokio::test]
    async fn rejects_non_websocket_endpoint() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport = WsTransport::new(tx, Backoff::default());
        assert!(transport.open("http://127.0.0.1:1/ws").is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn unreachable_server_reports_connect_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WsTransport::new(
            tx,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(20)),
        );
        transport.open("ws://127.0.0.1:1/ws").expect("open");
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("event");
        assert!(matches!(event, TransportEvent::ConnectError(_)));
        assert!(transport
            .send(&ClientRequest::DeleteMessage {
                message_id: shared::domain::MessageId::new("m"),
                room_id: None,
                tenant_slug: "demo".into(),
            })
            .is_err());
        transport.close();
    }
}
