// WebSocket client for the battle server's push channel.
//
// The transport task owns the socket. It reconnects on its own after a fixed
// delay and reports connection changes and inbound text frames to the event
// loop. It exits when the owner drops the outbound sender.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::link::connection::ConnectionError;
use crate::protocol::{ClientFrame, SubmitAnswer};

/// Events emitted by the transport task to the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed; frames may be sent.
    Connected,
    /// The socket dropped. The task will retry after its reconnect delay.
    Disconnected { reason: String },
    /// A text frame from the server (raw JSON).
    Frame(String),
    /// An answer frame was dropped without reaching the socket.
    Undelivered(SubmitAnswer),
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub url: String,
    pub bearer_token: Option<String>,
    pub reconnect_delay: Duration,
}

/// Why a pump loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The connection is gone; reconnect.
    Dropped(String),
    /// The owner dropped its end of a channel; stop for good.
    OwnerGone,
}

/// Run the transport until the owner drops `outbound`.
pub async fn run_transport(
    settings: TransportSettings,
    mut outbound: mpsc::Receiver<ClientFrame>,
    events: mpsc::Sender<TransportEvent>,
) {
    loop {
        match open(&settings).await {
            Ok(ws) => {
                info!("Connected to {}", settings.url);
                if discard_queued(&mut outbound, &events).await {
                    return;
                }
                if events.send(TransportEvent::Connected).await.is_err() {
                    return;
                }

                let (write, read) = ws.split();
                match pump(read, write, &mut outbound, &events).await {
                    PumpExit::OwnerGone => {
                        info!("Transport owner gone, closing connection");
                        return;
                    }
                    PumpExit::Dropped(reason) => {
                        warn!("Connection to {} dropped: {}", settings.url, reason);
                        if events
                            .send(TransportEvent::Disconnected { reason })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", settings.url, e);
            }
        }

        if wait_for_retry(&mut outbound, &events, settings.reconnect_delay).await {
            info!("Transport owner gone while waiting to reconnect");
            return;
        }
        info!("Reconnecting to {}", settings.url);
    }
}

async fn open(
    settings: &TransportSettings,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ConnectionError> {
    let mut request = settings.url.as_str().into_client_request()?;
    if let Some(token) = &settings.bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ConnectionError::InvalidCredential)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Drop a frame that will never be written. Answers are handed back to the
/// event loop as `Undelivered`. Returns `true` when the owner is gone.
async fn drop_frame(frame: ClientFrame, events: &mpsc::Sender<TransportEvent>) -> bool {
    match frame.as_answer() {
        Some(answer) => {
            warn!("Answer for question {} not delivered", answer.question_id);
            events
                .send(TransportEvent::Undelivered(answer.clone()))
                .await
                .is_err()
        }
        None => {
            debug!("Dropping frame while disconnected: {:?}", frame);
            false
        }
    }
}

/// Drop frames queued while the link was down; they were meant for the old
/// connection. Returns `true` when the owner is gone.
async fn discard_queued(
    outbound: &mut mpsc::Receiver<ClientFrame>,
    events: &mpsc::Sender<TransportEvent>,
) -> bool {
    loop {
        match outbound.try_recv() {
            Ok(frame) => {
                if drop_frame(frame, events).await {
                    return true;
                }
            }
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}

/// Sleep for `delay`, discarding any frames sent meanwhile. Returns `true`
/// when the owner dropped the sender.
async fn wait_for_retry(
    outbound: &mut mpsc::Receiver<ClientFrame>,
    events: &mpsc::Sender<TransportEvent>,
    delay: Duration,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if drop_frame(frame, events).await {
                        return true;
                    }
                }
                None => return true,
            },
        }
    }
}

/// Shuttle frames between one open connection and the event loop.
///
/// Generic over the read stream and the write sink so it can be tested with
/// in-memory streams.
pub async fn pump<R, W>(
    mut read: R,
    mut write: W,
    outbound: &mut mpsc::Receiver<ClientFrame>,
    events: &mpsc::Sender<TransportEvent>,
) -> PumpExit
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    trace!("<- {}", text.as_str());
                    if events.send(TransportEvent::Frame(text.to_string())).await.is_err() {
                        return PumpExit::OwnerGone;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return PumpExit::Dropped("server sent close frame".to_string());
                }
                Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
                None => return PumpExit::Dropped("stream ended".to_string()),
                Some(Ok(_)) => {
                    // Binary, Ping, Pong and raw frames carry nothing for us.
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let text = match frame.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize outbound frame: {}", e);
                            continue;
                        }
                    };
                    trace!("-> {}", text);
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        if drop_frame(frame, events).await {
                            return PumpExit::OwnerGone;
                        }
                        return PumpExit::Dropped(e.to_string());
                    }
                }
                None => {
                    let _ = write.close().await;
                    return PumpExit::OwnerGone;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{sink, stream};
    use std::sync::{Arc, Mutex};

    /// A sink that never fails and drops everything.
    fn null_sink() -> impl Sink<Message, Error = WsError> + Unpin {
        sink::drain().sink_map_err(|never| match never {})
    }

    #[tokio::test]
    async fn text_frames_forwarded_until_close() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_out_tx, mut out_rx) = mpsc::channel(16);
        let read = stream::iter(vec![
            Ok(Message::Text("first".into())),
            Ok(Message::Ping(Vec::new().into())),
            Ok(Message::Text("second".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("after close".into())),
        ]);

        let exit = pump(read, null_sink(), &mut out_rx, &events_tx).await;
        assert_eq!(exit, PumpExit::Dropped("server sent close frame".into()));
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Frame("first".into())));
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Frame("second".into())));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_error_drops_connection() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (_out_tx, mut out_rx) = mpsc::channel(16);
        let read = stream::iter(vec![Err(WsError::ConnectionClosed)]);
        let exit = pump(read, null_sink(), &mut out_rx, &events_tx).await;
        assert!(matches!(exit, PumpExit::Dropped(_)));
    }

    #[tokio::test]
    async fn outbound_frames_written_as_json_text() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink_log = written.clone();
        let write = Box::pin(sink::unfold((), move |(), msg: Message| {
            let sink_log = sink_log.clone();
            async move {
                sink_log.lock().unwrap().push(msg);
                Ok::<_, WsError>(())
            }
        }));

        out_tx.send(ClientFrame::heartbeat(42)).await.unwrap();
        drop(out_tx);

        let read = stream::pending::<Result<Message, WsError>>();
        let exit = pump(read, write, &mut out_rx, &events_tx).await;
        assert_eq!(exit, PumpExit::OwnerGone);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 1);
        let text = written[0].to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["destination"], "/app/battle/heartbeat");
        assert_eq!(value["payload"]["matchId"], 42);
    }

    #[tokio::test]
    async fn closed_event_channel_stops_pump() {
        let (events_tx, events_rx) = mpsc::channel(16);
        drop(events_rx);
        let (_out_tx, mut out_rx) = mpsc::channel(16);
        let read = stream::iter(vec![Ok(Message::Text("x".into()))]);
        let exit = pump(read, null_sink(), &mut out_rx, &events_tx).await;
        assert_eq!(exit, PumpExit::OwnerGone);
    }

    fn answer_501() -> SubmitAnswer {
        SubmitAnswer {
            match_id: 42,
            question_id: 501,
            answer: "B".into(),
            auto_submitted: false,
        }
    }

    #[tokio::test]
    async fn retry_wait_ends_early_when_owner_leaves() {
        tokio::time::pause();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(4);
        out_tx.send(ClientFrame::heartbeat(1)).await.unwrap();
        drop(out_tx);
        assert!(wait_for_retry(&mut out_rx, &events_tx, Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_wait_sleeps_full_delay() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (_out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(4);
        let start = Instant::now();
        assert!(!wait_for_retry(&mut out_rx, &events_tx, Duration::from_secs(5)).await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn answer_dropped_while_disconnected_is_reported() {
        tokio::time::pause();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(4);
        out_tx.send(ClientFrame::heartbeat(42)).await.unwrap();
        out_tx.send(ClientFrame::answer(answer_501())).await.unwrap();

        assert!(!wait_for_retry(&mut out_rx, &events_tx, Duration::from_secs(5)).await);
        assert_eq!(
            events_rx.try_recv().ok(),
            Some(TransportEvent::Undelivered(answer_501()))
        );
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_frames_are_discarded() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(4);
        out_tx.try_send(ClientFrame::heartbeat(1)).unwrap();
        out_tx.try_send(ClientFrame::answer(answer_501())).unwrap();
        assert!(!discard_queued(&mut out_rx, &events_tx).await);
        assert!(out_rx.try_recv().is_err());
        assert_eq!(
            events_rx.try_recv().ok(),
            Some(TransportEvent::Undelivered(answer_501()))
        );
        drop(out_tx);
        assert!(discard_queued(&mut out_rx, &events_tx).await);
    }

    #[tokio::test]
    async fn answer_lost_on_write_error_is_reported() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let write = Box::pin(sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(WsError::ConnectionClosed)
        }));
        out_tx.send(ClientFrame::answer(answer_501())).await.unwrap();

        let read = stream::pending::<Result<Message, WsError>>();
        let exit = pump(read, write, &mut out_rx, &events_tx).await;
        assert!(matches!(exit, PumpExit::Dropped(_)));
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Undelivered(answer_501()))
        );
    }
}
