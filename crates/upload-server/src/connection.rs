//! Client connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use chunkdock_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE,
    WS_PING_PERIOD, WS_PONG_WAIT,
};
use chunkdock_protocol::envelope::Message;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::binary::{parse_binary_message, peek_message_id};
use crate::handler::Handler;

/// Metadata about a connected client.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    /// Server-assigned connection id.
    pub client_id: String,
    pub remote_addr: String,
}

/// Handle for sending messages to one client.
///
/// Cloneable and cheap: wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the client disconnected.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Pushes an unsolicited event with a fresh message id.
    pub fn send_event<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<(), SendError> {
        let msg = Message::new(uuid::Uuid::new_v4().to_string(), msg_type, Some(payload))
            .map_err(|_| SendError)?;
        self.send_msg(msg)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to one client.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct ClientConnection {
    pub meta: ClientMeta,
    sender: Sender,
    cancel: CancellationToken,
    read_task: JoinHandle<()>,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Returns `true` until the read pump has finished.
    pub fn is_alive(&self) -> bool {
        !self.read_task.is_finished()
    }

    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signals the pumps to stop and waits for the disconnect hook to run.
    pub async fn close_and_wait(self) {
        self.cancel.cancel();
        let _ = self.read_task.await;
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// Returns the [`ClientConnection`] handle. The pumps run as background
/// tokio tasks and stop when the connection is closed or the cancel
/// token is triggered.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: ClientMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let (ws_sink, ws_stream) = ws_stream.split();

    // Write pump.
    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    // Read pump.
    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    let read_meta = meta.clone();
    let read_task = tokio::spawn(async move {
        read_pump(ws_stream, read_sender, handler.clone(), read_cancel.clone()).await;
        // When read pump exits, cancel the write pump too.
        read_cancel.cancel();
        handler.on_client_disconnected(&read_meta).await;
        tracing::info!(client = %read_meta.client_id, "client disconnected");
    });

    ClientConnection {
        meta,
        sender,
        cancel,
        read_task,
    }
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
///
/// Messages from one client are handled in arrival order; clients that
/// want parallel chunk transfers open several connections.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    // A dispatch longer than the deadline must not leave queued ticks behind.
    pong_deadline.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        // Any traffic proves the client is alive.
                        got_pong = true;
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_text(&handler, &sender, &text).await;
                            }
                            WsMessage::Binary(data) => {
                                if data.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_binary(&handler, &sender, &data).await;
                            }
                            WsMessage::Pong(_) => {
                                pong_deadline.reset();
                            }
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::debug!("received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::Ping => handler.on_ping(s, msg).await,
        MessageType::AllocateIdentifier => handler.on_allocate_identifier(s, msg).await,
        MessageType::AdmitChunk => handler.on_admit_chunk(s, msg).await,
        MessageType::SaveChunk => handler.on_save_chunk(s, msg).await,
        MessageType::GetRecord => handler.on_get_record(s, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

/// Dispatches a binary WebSocket frame to the handler.
async fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_binary_message(data) {
        Ok((header, payload)) => {
            handler
                .on_binary_chunk(sender.clone(), header, payload)
                .await;
        }
        Err(e) => {
            tracing::error!("failed to parse binary message: {e}");
            if let Some(id) = peek_message_id(data) {
                let _ = sender.send_msg(Message::error(
                    id,
                    WS_ERR_CODE_BAD_REQUEST,
                    format!("invalid binary frame: {e}"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::handler::HandlerFuture;

    const SLOW_DISPATCH: Duration = Duration::from_secs(150);

    /// Answers pings only after a dispatch longer than two pong windows.
    struct SlowPing;

    impl Handler for SlowPing {
        fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                tokio::time::sleep(SLOW_DISPATCH).await;
                if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                    let _ = sender.send_msg(reply);
                }
            })
        }
    }

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn send_event_uses_fresh_ids() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = Sender { tx };

        sender
            .send_event(MessageType::UploadProgress, &serde_json::json!({"uploadId": "u1"}))
            .unwrap();
        sender
            .send_event(MessageType::UploadProgress, &serde_json::json!({"uploadId": "u1"}))
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                WsMessage::Text(text) => {
                    let msg: Message = serde_json::from_str(&text).unwrap();
                    assert_eq!(msg.msg_type, MessageType::UploadProgress);
                    ids.push(msg.id);
                }
                other => panic!("expected text frame, got {other:?}"),
            }
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn sender_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let sender = Sender { tx };
        assert!(sender.is_connected());
        drop(rx);
        assert!(!sender.is_connected());
        assert!(sender.send_msg(Message::error("x", 500, "gone")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dispatch_keeps_a_full_read_window() {
        let (tx, mut rx) = mpsc::channel(4);
        let ping = Message::new("m1", MessageType::Ping, Option::<&()>::None).unwrap();
        let ping = serde_json::to_string(&ping).unwrap();
        let frames: Vec<Result<WsMessage, tokio_tungstenite::tungstenite::Error>> =
            vec![Ok(WsMessage::Text(ping.into()))];
        let stream = futures_util::stream::iter(frames).chain(futures_util::stream::pending());

        let start = Instant::now();
        read_pump(stream, Sender { tx }, Arc::new(SlowPing), CancellationToken::new()).await;

        // The ping was answered, then the client got one whole window of silence.
        assert!(start.elapsed() >= SLOW_DISPATCH + WS_PONG_WAIT);
        match rx.try_recv().unwrap() {
            WsMessage::Text(text) => {
                let msg: Message = serde_json::from_str(&text).unwrap();
                assert_eq!(msg.msg_type, MessageType::Pong);
                assert_eq!(msg.id, "m1");
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }
}
