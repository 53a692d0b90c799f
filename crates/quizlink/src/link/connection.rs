// Lifecycle of the push channel: connect, settle, drop, disconnect.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{ClientFrame, ConnectionStatus};
use crate::timer::OneShot;
use crate::ws_client::{run_transport, TransportEvent, TransportSettings};

/// Capacity of the outbound frame queue to the transport task.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("push channel is not connected")]
    NotConnected,
    #[error("transport task has stopped")]
    ChannelClosed,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("WebSocket error: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("bearer credential is not a valid header value")]
    InvalidCredential,
}

/// Something frames can be written to.
pub trait FramePublisher {
    fn publish(&self, frame: ClientFrame) -> Result<(), ConnectionError>;
}

/// Starts the transport task for a connection.
pub trait PushConnector: Send + Sync {
    fn spawn(
        &self,
        outbound: mpsc::Receiver<ClientFrame>,
        events: mpsc::Sender<TransportEvent>,
    ) -> JoinHandle<()>;
}

/// Production connector: a tokio-tungstenite transport task.
#[derive(Debug, Clone)]
pub struct WsConnector {
    settings: TransportSettings,
}

impl WsConnector {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }
}

impl PushConnector for WsConnector {
    fn spawn(
        &self,
        outbound: mpsc::Receiver<ClientFrame>,
        events: mpsc::Sender<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_transport(self.settings.clone(), outbound, events))
    }
}

/// Timers owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTimer {
    /// The settle delay after connect elapsed: subscribe and join now.
    Settled,
    /// No handshake acknowledgment within the connect timeout.
    ConnectTimedOut,
}

/// Owns the push channel. At most one transport task exists at a time.
pub struct ConnectionManager {
    connector: Arc<dyn PushConnector>,
    events_tx: mpsc::Sender<TransportEvent>,
    status: ConnectionStatus,
    outbound: Option<mpsc::Sender<ClientFrame>>,
    task: Option<JoinHandle<()>>,
    settle: OneShot,
    connect_timeout: OneShot,
    settle_delay: Duration,
    connect_timeout_delay: Duration,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        events_tx: mpsc::Sender<TransportEvent>,
        settle_delay: Duration,
        connect_timeout_delay: Duration,
    ) -> Self {
        Self {
            connector,
            events_tx,
            status: ConnectionStatus::Disconnected,
            outbound: None,
            task: None,
            settle: OneShot::new(),
            connect_timeout: OneShot::new(),
            settle_delay,
            connect_timeout_delay,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// A transport task exists (it may be between reconnect attempts).
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Open the channel. A no-op while a transport task is alive, whatever
    /// its current status. Returns `true` when a new task was started.
    pub fn connect(&mut self) -> bool {
        if self.is_active() {
            debug!("connect ignored: transport already running ({:?})", self.status);
            return false;
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.task = Some(self.connector.spawn(outbound_rx, self.events_tx.clone()));
        self.outbound = Some(outbound_tx);
        self.status = ConnectionStatus::Connecting;
        self.connect_timeout.arm(self.connect_timeout_delay);
        info!("Connecting push channel");
        true
    }

    /// The transport completed a handshake. Returns `false` for a stale
    /// event from a task we already tore down.
    pub fn on_connected(&mut self) -> bool {
        if self.task.is_none() {
            debug!("ignoring connected event after disconnect");
            return false;
        }
        self.status = ConnectionStatus::Connected;
        self.connect_timeout.cancel();
        self.settle.arm(self.settle_delay);
        info!("Push channel connected, settling for {:?}", self.settle_delay);
        true
    }

    /// The transport lost its connection and will retry on its own.
    pub fn on_dropped(&mut self, reason: &str) -> bool {
        if self.task.is_none() {
            return false;
        }
        warn!("Push channel dropped: {}", reason);
        self.status = ConnectionStatus::Reconnecting;
        self.settle.cancel();
        true
    }

    fn on_connect_timeout(&mut self) {
        warn!(
            "No handshake acknowledgment within {:?}; push channel not connected",
            self.connect_timeout_delay
        );
        self.status = ConnectionStatus::Disconnected;
    }

    /// Close the channel and cancel every timer. Always safe to call.
    pub fn disconnect(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.settle.cancel();
        self.connect_timeout.cancel();
        if self.status != ConnectionStatus::Disconnected {
            info!("Push channel disconnected");
        }
        self.status = ConnectionStatus::Disconnected;
    }

    /// Wait for the next connection timer. Pends forever when none is armed.
    pub async fn next_timer(&mut self) -> ConnectionTimer {
        tokio::select! {
            _ = self.settle.fired() => ConnectionTimer::Settled,
            _ = self.connect_timeout.fired() => {
                self.on_connect_timeout();
                ConnectionTimer::ConnectTimedOut
            }
        }
    }
}

impl FramePublisher for ConnectionManager {
    fn publish(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::QueueFull,
            TrySendError::Closed(_) => ConnectionError::ChannelClosed,
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Connector that hands the outbound receiver to the test instead of
    /// opening a socket.
    #[derive(Default)]
    pub(crate) struct CapturingConnector {
        pub(crate) spawned: Mutex<Vec<mpsc::Receiver<ClientFrame>>>,
    }

    impl PushConnector for CapturingConnector {
        fn spawn(
            &self,
            outbound: mpsc::Receiver<ClientFrame>,
            _events: mpsc::Sender<TransportEvent>,
        ) -> JoinHandle<()> {
            self.spawned.lock().unwrap().push(outbound);
            tokio::spawn(std::future::pending::<()>())
        }
    }

    fn manager(connector: Arc<CapturingConnector>) -> ConnectionManager {
        let (events_tx, _events_rx) = mpsc::channel(16);
        ConnectionManager::new(
            connector,
            events_tx,
            Duration::from_millis(300),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let connector = Arc::new(CapturingConnector::default());
        let mut conn = manager(connector.clone());
        assert!(conn.connect());
        assert!(!conn.connect());
        conn.on_connected();
        assert!(!conn.connect());
        assert_eq!(connector.spawned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_requires_connected() {
        let connector = Arc::new(CapturingConnector::default());
        let mut conn = manager(connector.clone());
        assert!(matches!(
            conn.publish(ClientFrame::heartbeat(1)),
            Err(ConnectionError::NotConnected)
        ));

        conn.connect();
        assert!(conn.publish(ClientFrame::heartbeat(1)).is_err());
        conn.on_connected();
        conn.publish(ClientFrame::heartbeat(1)).unwrap();

        let mut rx = connector.spawned.lock().unwrap().pop().unwrap();
        assert_eq!(rx.try_recv().unwrap(), ClientFrame::heartbeat(1));
    }

    #[tokio::test]
    async fn settle_fires_after_connect() {
        tokio::time::pause();
        let mut conn = manager(Arc::new(CapturingConnector::default()));
        conn.connect();
        conn.on_connected();
        assert_eq!(conn.next_timer().await, ConnectionTimer::Settled);
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn connect_timeout_marks_disconnected() {
        tokio::time::pause();
        let mut conn = manager(Arc::new(CapturingConnector::default()));
        conn.connect();
        assert_eq!(conn.next_timer().await, ConnectionTimer::ConnectTimedOut);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        // The transport keeps retrying on its own; no second task.
        assert!(!conn.connect());
    }

    #[tokio::test]
    async fn drop_then_disconnect_cancels_everything() {
        tokio::time::pause();
        let mut conn = manager(Arc::new(CapturingConnector::default()));
        conn.connect();
        conn.on_connected();
        assert!(conn.on_dropped("reset"));
        assert_eq!(conn.status(), ConnectionStatus::Reconnecting);

        conn.disconnect();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(!conn.on_connected());
        let result = tokio::time::timeout(Duration::from_secs(30), conn.next_timer()).await;
        assert!(result.is_err());
    }
}
