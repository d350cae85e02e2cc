//! Book transfer engine: streams one book from the link straight into storage.
//!
//! Two sub-protocols follow the `willAccept` reply:
//! - chunked: each chunk is announced by a `BOOK_DATA` frame carrying `{length, isLast}`,
//!   acknowledged, then sent as raw bytes and acknowledged again once written;
//! - raw: exactly `length` bytes follow the reply with no framing at all.
//!
//! Only one chunk buffer is ever held. A transfer that does not finish removes its file.

use std::io::Write;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::buffer::RecvBuffer;
use crate::callbacks::Callbacks;
use crate::error::{Result, SyncError};
use crate::json;
use crate::protocol::{Opcode, Vocabulary};
use crate::storage::{parent_dir, Storage};
use crate::transport::{ByteStream, CancelHandle};
use crate::wire::{read_frame, write_frame};

/// Largest chunk read or written in one step.
pub const CHUNK_SIZE: usize = 4096;

/// Which sub-protocol carries the book bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Chunked,
    Raw,
}

impl TransferMode {
    /// A forced mode wins, then the peer's `willStreamBinary` hint, then the role default:
    /// a device that dialled out expects chunks, a device that accepted the peer expects raw bytes.
    pub fn select(
        forced: Option<TransferMode>,
        peer_streams_binary: Option<bool>,
        accepted: bool,
    ) -> Self {
        if let Some(mode) = forced {
            return mode;
        }
        match peer_streams_binary {
            Some(true) => TransferMode::Raw,
            Some(false) => TransferMode::Chunked,
            None if accepted => TransferMode::Raw,
            None => TransferMode::Chunked,
        }
    }
}

/// Metadata of the book being sent, as read from a SEND_BOOK payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookMeta {
    pub lpath: String,
    pub title: String,
    pub authors: Vec<String>,
    pub uuid: String,
    pub calibre_id: Option<i64>,
    /// Declared byte count.
    pub size: u64,
}

impl BookMeta {
    /// Missing fields are left empty; a negative or absent length reads as 0 and is rejected later.
    pub fn from_payload(payload: &str) -> Self {
        let authors = json::find_string_array(payload, "authors")
            .map(|list| list.into_iter().map(str::to_string).collect())
            .or_else(|| json::find_string(payload, "authors").map(|a| vec![a.to_string()]))
            .unwrap_or_default();
        let size = json::find_int(payload, "length")
            .or_else(|| json::find_int(payload, "size"))
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);
        Self {
            lpath: json::find_string(payload, "lpath").unwrap_or_default().to_string(),
            title: json::find_string(payload, "title").unwrap_or_default().to_string(),
            authors,
            uuid: json::find_string(payload, "uuid").unwrap_or_default().to_string(),
            calibre_id: json::find_int(payload, "calibre_id")
                .or_else(|| json::find_int(payload, "application_id")),
            size,
        }
    }
}

/// Everything a transfer needs besides the collaborators.
#[derive(Debug, Clone)]
pub struct TransferPlan<'a> {
    pub meta: &'a BookMeta,
    /// Storage path of the destination file, already validated.
    pub dest: &'a str,
    pub mode: TransferMode,
    pub vocab: Vocabulary,
    pub timeout: Duration,
}

/// The engine's view of the connection: the link and its receive buffer, the storage, the
/// caller's hooks and the cancellation flag.
pub struct TransferIo<'a, S: ByteStream + ?Sized> {
    pub stream: &'a mut S,
    pub rx: &'a mut RecvBuffer,
    pub storage: &'a dyn Storage,
    pub callbacks: &'a mut Callbacks,
    pub cancel: &'a CancelHandle,
}

/// Open the destination, accept the book, receive it, then report BOOK_DONE.
/// Returns the number of bytes written. On failure no file is left at `plan.dest`.
pub fn receive_book<S: ByteStream + ?Sized>(
    io: TransferIo<'_, S>,
    plan: &TransferPlan<'_>,
) -> Result<u64> {
    let TransferIo {
        stream,
        rx,
        storage,
        callbacks,
        cancel,
    } = io;

    if let Some(dir) = parent_dir(plan.dest) {
        storage
            .create_dir_all(dir)
            .map_err(|e| SyncError::Storage(format!("create {dir}: {e}")))?;
    }
    let mut file = storage
        .create(plan.dest)
        .map_err(|e| SyncError::Storage(format!("open {}: {e}", plan.dest)))?;

    info!(
        "Receiving {:?} ({} bytes, {:?}) into {}",
        plan.meta.title, plan.meta.size, plan.mode, plan.dest
    );
    let result = accept_and_stream(stream, rx, &mut *file, callbacks, cancel, plan);
    drop(file);

    let received = match result {
        Ok(n) => n,
        Err(e) => {
            warn!("Transfer of {} failed: {}", plan.dest, e);
            if let Err(rm) = storage.remove(plan.dest) {
                warn!("Could not remove partial file {}: {}", plan.dest, rm);
            }
            return Err(e);
        }
    };

    info!("Book received: {} ({} bytes)", plan.dest, received);
    callbacks.book_received(plan.meta, plan.dest);
    let done = serde_json::json!({ "lpath": plan.meta.lpath });
    write_frame(stream, plan.vocab, Opcode::BookDone, &done.to_string())?;
    Ok(received)
}

fn accept_and_stream<S: ByteStream + ?Sized>(
    stream: &mut S,
    rx: &mut RecvBuffer,
    file: &mut dyn Write,
    callbacks: &mut Callbacks,
    cancel: &CancelHandle,
    plan: &TransferPlan<'_>,
) -> Result<u64> {
    let accept = serde_json::json!({
        "willAccept": true,
        "willStreamBinary": plan.mode == TransferMode::Raw,
    });
    write_frame(stream, plan.vocab, Opcode::Ok, &accept.to_string())?;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let received = match plan.mode {
        TransferMode::Raw => receive_raw(stream, file, &mut chunk, callbacks, cancel, plan)?,
        TransferMode::Chunked => {
            receive_chunked(stream, rx, file, &mut chunk, callbacks, cancel, plan)?
        }
    };
    file.flush().map_err(SyncError::Write)?;
    Ok(received)
}

fn receive_raw<S: ByteStream + ?Sized>(
    stream: &mut S,
    file: &mut dyn Write,
    chunk: &mut [u8],
    callbacks: &mut Callbacks,
    cancel: &CancelHandle,
    plan: &TransferPlan<'_>,
) -> Result<u64> {
    let expected = plan.meta.size;
    let mut received = 0u64;
    while received < expected {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let n = (expected - received).min(chunk.len() as u64) as usize;
        stream.recv_exact(&mut chunk[..n], plan.timeout)?;
        file.write_all(&chunk[..n]).map_err(SyncError::Write)?;
        received += n as u64;
        report_progress(callbacks, received, expected)?;
    }
    Ok(received)
}

fn receive_chunked<S: ByteStream + ?Sized>(
    stream: &mut S,
    rx: &mut RecvBuffer,
    file: &mut dyn Write,
    chunk: &mut [u8],
    callbacks: &mut Callbacks,
    cancel: &CancelHandle,
    plan: &TransferPlan<'_>,
) -> Result<u64> {
    let expected = plan.meta.size;
    let mut received = 0u64;
    while received < expected {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let header = read_frame(stream, rx, plan.timeout)?;
        match header.opcode() {
            Some(Opcode::BookData) | Some(Opcode::Ok) => {}
            _ => {
                return Err(SyncError::Protocol(format!(
                    "unexpected {:?} during book transfer",
                    header.opcode
                )))
            }
        }
        let payload = header.payload(rx);
        let len = json::find_int(payload, "length").unwrap_or(0);
        let is_last = json::find_bool(payload, "isLast").unwrap_or(false);
        if len <= 0 || len as usize > chunk.len() || received + len as u64 > expected {
            return Err(SyncError::Protocol(format!("invalid chunk length {len}")));
        }
        let len = len as usize;

        write_frame(stream, plan.vocab, Opcode::Ok, "{}")?;
        stream.recv_exact(&mut chunk[..len], plan.timeout)?;
        file.write_all(&chunk[..len]).map_err(SyncError::Write)?;
        received += len as u64;
        report_progress(callbacks, received, expected)?;
        write_frame(stream, plan.vocab, Opcode::Ok, "{}")?;

        if is_last {
            break;
        }
    }
    if received != expected {
        return Err(SyncError::Protocol(format!(
            "transfer ended at {received} of {expected} bytes"
        )));
    }
    Ok(received)
}

fn report_progress(callbacks: &mut Callbacks, received: u64, expected: u64) -> Result<()> {
    debug!("Progress: {} / {} bytes", received, expected);
    if callbacks.progress(received, expected) {
        Ok(())
    } else {
        Err(SyncError::Cancelled)
    }
}
