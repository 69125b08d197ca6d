//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the upload logic while the server framework
//! handles connection management, routing, and the binary protocol.

use std::future::Future;
use std::pin::Pin;

use chunkdock_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use chunkdock_protocol::envelope::Message;

use crate::binary::BinaryChunkHeader;
use crate::connection::{ClientMeta, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling WebSocket messages from upload clients.
///
/// The server dispatches parsed messages to the appropriate method. Each
/// method receives:
/// - `sender`: channel to send responses/events back to the client
/// - `msg`: the parsed JSON envelope (for text) or binary chunk
///
/// Default implementations reply with "not implemented" so handlers only
/// need to override the message types they care about.
pub trait Handler: Send + Sync + 'static {
    /// Called once the WebSocket handshake with a client completes.
    fn on_client_connected(&self, meta: &ClientMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }

    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) =
                msg.reply(chunkdock_protocol::MessageType::Pong, Option::<&()>::None)
            {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `allocate_identifier`.
    fn on_allocate_identifier(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `admit_chunk`.
    fn on_admit_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `save_chunk` (base64 payload inside the JSON envelope).
    fn on_save_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `get_record`.
    fn on_get_record(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for a binary chunk frame.
    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = data;
        Box::pin(async move {
            let _ = sender.send_msg(Message::error(
                header.id,
                WS_ERR_CODE_NOT_IMPLEMENTED,
                "binary chunks not implemented",
            ));
        })
    }

    /// Called when a client disconnects (cleanup hook).
    fn on_client_disconnected(&self, meta: &ClientMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }
}
