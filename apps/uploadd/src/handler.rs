//! WebSocket handler that drives the upload coordinator.
//!
//! Coordinator calls block on disk I/O (and the completing chunk runs the
//! merge), so each one runs on the blocking pool.

use std::sync::Arc;

use chunkdock_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_INTERNAL, WS_ERR_CODE_NOT_FOUND,
    WS_ERR_CODE_TOO_LARGE, WS_ERR_CODE_UNPROCESSABLE,
};
use chunkdock_protocol::messages::{
    AdmitChunkRequest, AdmitChunkResponse, ChunkSavedResponse, GetRecordRequest,
    IdentifierResponse, RecordResponse, SaveChunkRequest, UploadProgressEvent,
};
use chunkdock_protocol::{Message, MessageType};
use chunkdock_server::{BinaryChunkHeader, ClientMeta, Handler, HandlerFuture, Sender};
use chunkdock_transfer::{Coordinator, Declaration, ErrorKind, RecordStore, TransferError};
use serde::Serialize;

/// Error reply: wire code plus message.
type Reply = (i32, String);

/// One chunk as received over either transport.
struct IncomingChunk {
    upload_id: String,
    decl: Declaration,
    chunk_number: u32,
    current_chunk_size: u64,
    data: Vec<u8>,
    checksum: String,
}

impl From<SaveChunkRequest> for IncomingChunk {
    fn from(req: SaveChunkRequest) -> Self {
        Self {
            upload_id: req.upload_id,
            decl: Declaration::new(req.file_name, req.total_chunks, req.total_size),
            chunk_number: req.chunk_number,
            current_chunk_size: req.current_chunk_size,
            data: req.data,
            checksum: req.checksum,
        }
    }
}

impl IncomingChunk {
    fn from_binary(header: BinaryChunkHeader, data: Vec<u8>) -> Self {
        Self {
            upload_id: header.upload_id,
            decl: Declaration::new(header.file_name, header.total_chunks, header.total_size),
            chunk_number: header.chunk_number,
            current_chunk_size: header.current_chunk_size,
            data,
            checksum: header.checksum,
        }
    }
}

/// Translates wire requests into coordinator calls.
pub struct UploadHandler<S> {
    coordinator: Arc<Coordinator<S>>,
}

impl<S: RecordStore + 'static> UploadHandler<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>) -> Self {
        Self { coordinator }
    }

    /// Runs `f` against the coordinator on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, Reply>
    where
        T: Send + 'static,
        F: FnOnce(&Coordinator<S>) -> Result<T, TransferError> + Send + 'static,
    {
        let coordinator = Arc::clone(&self.coordinator);
        match tokio::task::spawn_blocking(move || f(&coordinator)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(error_reply(&e)),
            Err(e) => {
                tracing::error!("coordinator task failed: {e}");
                Err((WS_ERR_CODE_INTERNAL, "internal error".into()))
            }
        }
    }

    async fn save_chunk(&self, sender: &Sender, request_id: &str, chunk: IncomingChunk) {
        if chunk.data.len() as u64 != chunk.current_chunk_size {
            let reason = format!(
                "payload length {} does not match currentChunkSize {}",
                chunk.data.len(),
                chunk.current_chunk_size
            );
            tracing::warn!(upload_id = %chunk.upload_id, chunk = chunk.chunk_number, "{reason}");
            let _ = sender.send_msg(Message::error(request_id, WS_ERR_CODE_BAD_REQUEST, reason));
            return;
        }

        let upload_id = chunk.upload_id.clone();
        let chunk_number = chunk.chunk_number;
        let result = self
            .call(move |c| {
                let before = c.get_record(&chunk.upload_id).ok();
                let checksum = Some(chunk.checksum.as_str()).filter(|s| !s.is_empty());
                let after = c.save(
                    &chunk.upload_id,
                    &chunk.decl,
                    chunk.chunk_number,
                    &chunk.data,
                    checksum,
                )?;
                let changed = before.as_ref() != Some(&after);
                Ok((after, changed))
            })
            .await;

        match result {
            Ok((record, changed)) => {
                let progress = UploadProgressEvent::from(&record);
                let resp = ChunkSavedResponse {
                    upload_id,
                    chunk_number,
                    record,
                };
                reply(sender, request_id, MessageType::ChunkSaved, &resp);
                if changed {
                    let _ = sender.send_event(MessageType::UploadProgress, &progress);
                }
            }
            Err((code, message)) => {
                let _ = sender.send_msg(Message::error(request_id, code, message));
            }
        }
    }
}

impl<S: RecordStore + 'static> Handler for UploadHandler<S> {
    fn on_client_connected(&self, meta: &ClientMeta) -> HandlerFuture<'_> {
        tracing::debug!(client = %meta.client_id, addr = %meta.remote_addr, "upload client ready");
        Box::pin(async {})
    }

    fn on_allocate_identifier(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.call(|c| c.allocate()).await {
                Ok(upload_id) => {
                    let resp = IdentifierResponse { upload_id };
                    reply(&sender, &msg.id, MessageType::IdentifierResponse, &resp);
                }
                Err((code, message)) => {
                    let _ = sender.send_error(&msg, code, &message);
                }
            }
        })
    }

    fn on_admit_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: AdmitChunkRequest = match msg.require_payload() {
                Ok(r) => r,
                Err(reason) => {
                    let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, &reason);
                    return;
                }
            };

            let upload_id = req.upload_id.clone();
            let chunk_number = req.chunk_number;
            let result = self
                .call(move |c| {
                    let decl = Declaration::new(req.file_name, req.total_chunks, req.total_size);
                    c.admit(&req.upload_id, &decl, req.chunk_number)
                })
                .await;

            match result {
                Ok(admission) => {
                    let resp = AdmitChunkResponse {
                        upload_id,
                        chunk_number,
                        chunk_already_present: admission.is_already_present(),
                    };
                    reply(&sender, &msg.id, MessageType::AdmitResponse, &resp);
                }
                Err((code, message)) => {
                    let _ = sender.send_error(&msg, code, &message);
                }
            }
        })
    }

    fn on_save_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: SaveChunkRequest = match msg.require_payload() {
                Ok(r) => r,
                Err(reason) => {
                    let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, &reason);
                    return;
                }
            };
            self.save_chunk(&sender, &msg.id, req.into()).await;
        })
    }

    fn on_get_record(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: GetRecordRequest = match msg.require_payload() {
                Ok(r) => r,
                Err(reason) => {
                    let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, &reason);
                    return;
                }
            };

            match self.call(move |c| c.get_record(&req.upload_id)).await {
                Ok(record) => {
                    reply(&sender, &msg.id, MessageType::RecordResponse, &RecordResponse { record });
                }
                Err((code, message)) => {
                    let _ = sender.send_error(&msg, code, &message);
                }
            }
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let request_id = header.id.clone();
            let chunk = IncomingChunk::from_binary(header, data);
            self.save_chunk(&sender, &request_id, chunk).await;
        })
    }

    fn on_client_disconnected(&self, meta: &ClientMeta) -> HandlerFuture<'_> {
        tracing::debug!(client = %meta.client_id, "upload client gone");
        Box::pin(async {})
    }
}

fn reply<T: Serialize>(sender: &Sender, request_id: &str, msg_type: MessageType, payload: &T) {
    match Message::new(request_id, msg_type, Some(payload)) {
        Ok(msg) => {
            let _ = sender.send_msg(msg);
        }
        Err(e) => {
            tracing::error!("failed to encode reply: {e}");
            let _ = sender.send_msg(Message::error(request_id, WS_ERR_CODE_INTERNAL, "encoding failed"));
        }
    }
}

/// Maps a coordinator error to its wire code.
fn error_code(e: &TransferError) -> i32 {
    match e {
        TransferError::FlowChanged { .. } | TransferError::ChunkConflict { .. } => {
            WS_ERR_CODE_CONFLICT
        }
        TransferError::ChecksumMismatch { .. } => WS_ERR_CODE_UNPROCESSABLE,
        _ => match e.kind() {
            ErrorKind::Protocol => WS_ERR_CODE_BAD_REQUEST,
            ErrorKind::TooLarge => WS_ERR_CODE_TOO_LARGE,
            ErrorKind::NotFound => WS_ERR_CODE_NOT_FOUND,
            ErrorKind::Collision => WS_ERR_CODE_CONFLICT,
            ErrorKind::Transient | ErrorKind::Merge => WS_ERR_CODE_INTERNAL,
        },
    }
}

fn error_reply(e: &TransferError) -> Reply {
    let code = error_code(e);
    if code >= WS_ERR_CODE_INTERNAL {
        tracing::error!(code, "request failed: {e}");
    } else {
        tracing::warn!(code, "request rejected: {e}");
    }
    (code, e.to_string())
}
