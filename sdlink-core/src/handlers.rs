//! Per-opcode handlers. One decoded message in, at most the replies the desktop application
//! expects out.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth;
use crate::error::{Result, SyncError, ValidationError};
use crate::json;
use crate::protocol::{Opcode, OpcodeToken, Vocabulary, CC_VERSION_NUMBER, PROTOCOL_VERSION};
use crate::session::{ConnectionPhase, Device, Peer, Role};
use crate::storage::{ESTIMATED_FREE_SPACE, ESTIMATED_TOTAL_SPACE};
use crate::transfer::{self, BookMeta, TransferIo, TransferMode, TransferPlan, CHUNK_SIZE};
use crate::transport::ByteStream;
use crate::validate::{check_lpath, check_size};
use crate::wire::{read_frame, write_frame, Frame};

/// `messageKind` the desktop application uses to report a wrong password.
const MESSAGE_KIND_PASSWORD_ERROR: i64 = 1;

/// Read one message from the peer and handle it.
pub(crate) fn process_one<S: ByteStream>(
    dev: &mut Device,
    peer: &mut Peer<S>,
) -> Result<OpcodeToken> {
    let frame = read_frame(&mut peer.stream, &mut peer.rx, dev.config.io_timeout())?;
    dispatch(dev, peer, &frame)?;
    Ok(frame.opcode)
}

pub(crate) fn dispatch<S: ByteStream>(
    dev: &mut Device,
    peer: &mut Peer<S>,
    frame: &Frame,
) -> Result<()> {
    let op = match &frame.opcode {
        OpcodeToken::Known(op) => *op,
        OpcodeToken::Unknown(raw) => {
            warn!("Ignoring unknown opcode {}", raw);
            return Ok(());
        }
    };
    debug!("Handling {} in {:?}", op, peer.phase);

    if peer.phase == ConnectionPhase::Handshake && needs_init(op) {
        let msg = format!("{op} before GET_INITIALIZATION_INFO");
        send_error(&mut peer.stream, dev.config.vocabulary, &msg)?;
        return Err(SyncError::Protocol(msg));
    }

    match op {
        Opcode::GetInitializationInfo => init_info(dev, peer, frame),
        Opcode::SetLibraryInfo => {
            let payload = frame.payload(&peer.rx);
            let name = json::find_string(payload, "libraryName").map(str::to_string);
            let uuid = json::find_string(payload, "libraryUUID").map(str::to_string);
            info!("Library: {:?} ({:?})", name, uuid);
            dev.library.name = name;
            dev.library.uuid = uuid;
            ok(peer, dev.config.vocabulary, json!({}))
        }
        Opcode::FreeSpace => {
            let free = dev.storage.free_space().unwrap_or(ESTIMATED_FREE_SPACE);
            ok(peer, dev.config.vocabulary, json!({ "free_space_on_device": free }))
        }
        Opcode::TotalSpace => {
            let total = dev.storage.total_space().unwrap_or(ESTIMATED_TOTAL_SPACE);
            ok(peer, dev.config.vocabulary, json!({ "total_space_on_device": total }))
        }
        // The device keeps no inventory, so both list requests report it empty.
        Opcode::SendBooklists | Opcode::GetBookCount => ok(
            peer,
            dev.config.vocabulary,
            json!({ "count": 0, "willStream": true, "willScan": false }),
        ),
        Opcode::GetDeviceInformation => {
            let reply = json!({
                "device_info": {
                    "device_store_uuid": dev.store_uuid,
                    "device_name": dev.config.name,
                    "location_code": "main",
                },
                "version": CC_VERSION_NUMBER,
                "device_version": dev.config.model,
            });
            ok(peer, dev.config.vocabulary, reply)
        }
        Opcode::SetCalibreDeviceInfo => {
            dev.desktop_info = Some(frame.payload(&peer.rx).to_string());
            ok(peer, dev.config.vocabulary, json!({}))
        }
        Opcode::SetCalibreDeviceName => {
            let name = json::find_string(frame.payload(&peer.rx), "name").map(str::to_string);
            info!("Desktop calls this device {:?}", name);
            dev.desktop_name = name;
            ok(peer, dev.config.vocabulary, json!({}))
        }
        Opcode::SendBook => send_book(dev, peer, frame),
        Opcode::DeleteBook => delete_book(dev, peer, frame),
        Opcode::SendBookMetadata => {
            debug!("Metadata update consumed");
            Ok(())
        }
        Opcode::DisplayMessage => {
            let payload = frame.payload(&peer.rx);
            let text = json::find_string(payload, "message").unwrap_or_default().to_string();
            let kind = json::find_int(payload, "messageKind").unwrap_or(0);
            info!("Desktop message: {}", text);
            dev.callbacks.message(&text);
            ok(peer, dev.config.vocabulary, json!({}))?;
            if kind == MESSAGE_KIND_PASSWORD_ERROR {
                return Err(SyncError::Auth(text));
            }
            Ok(())
        }
        Opcode::Noop => {
            // A NOOP with content (e.g. a progress count) is fire-and-forget; answering it
            // would hand the reply to the peer's next request.
            if json::is_empty_object(frame.payload(&peer.rx)) {
                ok(peer, dev.config.vocabulary, json!({}))
            } else {
                debug!("NOOP with payload consumed");
                Ok(())
            }
        }
        Opcode::Ok | Opcode::BookDone => Ok(()),
        Opcode::CalibreBusy => {
            info!("Desktop is busy");
            Err(SyncError::Busy)
        }
        Opcode::Error => {
            let payload = frame.payload(&peer.rx);
            let msg = json::find_string(payload, "message")
                .or_else(|| json::find_string(payload, "errorMessage"))
                .unwrap_or("unspecified")
                .to_string();
            warn!("Desktop reported an error: {}", msg);
            if peer.phase == ConnectionPhase::Handshake {
                Err(SyncError::Auth(msg))
            } else {
                Err(SyncError::Protocol(msg))
            }
        }
        Opcode::BookData | Opcode::GetBookFileSegment | Opcode::GetBookMetadata => {
            warn!("Ignoring {} outside of its exchange", op);
            Ok(())
        }
    }
}

fn needs_init(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::SetLibraryInfo
            | Opcode::FreeSpace
            | Opcode::TotalSpace
            | Opcode::GetBookCount
            | Opcode::SendBooklists
            | Opcode::GetDeviceInformation
            | Opcode::SetCalibreDeviceInfo
            | Opcode::SetCalibreDeviceName
            | Opcode::SendBook
            | Opcode::DeleteBook
            | Opcode::SendBookMetadata
    )
}

fn ok<S: ByteStream>(peer: &mut Peer<S>, vocab: Vocabulary, body: Value) -> Result<()> {
    write_frame(&mut peer.stream, vocab, Opcode::Ok, &body.to_string())
}

fn send_error<S: ByteStream + ?Sized>(
    stream: &mut S,
    vocab: Vocabulary,
    message: &str,
) -> Result<()> {
    write_frame(stream, vocab, Opcode::Error, &json!({ "message": message }).to_string())
}

/// Tell the peer why its request was refused. The link stays usable.
fn reject<S: ByteStream>(
    peer: &mut Peer<S>,
    vocab: Vocabulary,
    err: ValidationError,
) -> SyncError {
    warn!("Rejected request: {}", err);
    match send_error(&mut peer.stream, vocab, &err.to_string()) {
        Ok(()) => SyncError::Rejected(err),
        Err(send) => send,
    }
}

fn init_info<S: ByteStream>(dev: &mut Device, peer: &mut Peer<S>, frame: &Frame) -> Result<()> {
    let payload = frame.payload(&peer.rx);
    let version = json::find_int(payload, "serverProtocolVersion").unwrap_or(0);
    if version > PROTOCOL_VERSION {
        warn!(
            "Desktop protocol version {} is newer than {}; continuing",
            version, PROTOCOL_VERSION
        );
    }
    let challenge = json::find_string(payload, "passwordChallenge")
        .filter(|c| !c.is_empty())
        .unwrap_or(&peer.challenge)
        .to_string();
    if let Some(name) = json::find_string(payload, "currentLibraryName") {
        dev.library.name = Some(name.to_string());
    }
    if let Some(uuid) = json::find_string(payload, "currentLibraryUUID") {
        dev.library.uuid = Some(uuid.to_string());
    }

    let cfg = &dev.config;
    let caps = json!({
        "appName": format!("{} {}", cfg.manufacturer, cfg.model),
        "acceptedExtensions": cfg.extensions,
        "cacheUsesLpaths": true,
        "canAcceptLibraryInfo": true,
        "canDeleteMultipleBooks": true,
        "canReceiveBookBinary": true,
        "canSendOkToSendbook": true,
        "canStreamBooks": true,
        "canStreamMetadata": true,
        "canUseCachedMetadata": true,
        "ccVersionNumber": CC_VERSION_NUMBER,
        "coverHeight": 240,
        "deviceKind": cfg.model,
        "deviceName": cfg.name,
        "extensionPathLengths": {},
        "maxBookContentPacketLen": CHUNK_SIZE,
        "passwordHash": auth::capability_hash(cfg.password.as_deref(), &challenge),
        "useUuidFileNames": false,
        "versionOK": true,
        "currentLibraryName": dev.library.name.as_deref().unwrap_or(""),
        "currentLibraryUUID": dev.library.uuid.as_deref().unwrap_or(""),
    });
    ok(peer, cfg.vocabulary, caps)?;
    peer.phase = ConnectionPhase::Connected;
    info!("Handshake complete with {:?} desktop", peer.role);
    Ok(())
}

fn send_book<S: ByteStream>(dev: &mut Device, peer: &mut Peer<S>, frame: &Frame) -> Result<()> {
    let payload = frame.payload(&peer.rx);
    let meta = BookMeta::from_payload(payload);
    let peer_streams_binary = json::find_bool(payload, "willStreamBinary");
    let vocab = dev.config.vocabulary;

    if let Err(e) = check_lpath(&meta.lpath, &dev.config.extensions, dev.config.max_path_len)
        .and_then(|()| check_size(meta.size, dev.config.max_book_size))
    {
        return Err(reject(peer, vocab, e));
    }

    let mode = TransferMode::select(
        dev.config.transfer_mode,
        peer_streams_binary,
        peer.role == Role::Server,
    );
    let dest = dev.config.book_path(&meta.lpath);
    let plan = TransferPlan {
        meta: &meta,
        dest: &dest,
        mode,
        vocab,
        timeout: dev.config.io_timeout(),
    };

    peer.phase = ConnectionPhase::ReceivingBook;
    let result = transfer::receive_book(
        TransferIo {
            stream: &mut peer.stream,
            rx: &mut peer.rx,
            storage: dev.storage.as_ref(),
            callbacks: &mut dev.callbacks,
            cancel: &dev.cancel,
        },
        &plan,
    );
    peer.phase = ConnectionPhase::Connected;

    match result {
        Ok(_) => {
            dev.books_received += 1;
            Ok(())
        }
        // Nothing was accepted yet, so the stream is still aligned.
        Err(e @ SyncError::Storage(_)) => {
            send_error(&mut peer.stream, vocab, &e.to_string())?;
            Err(e)
        }
        Err(e) => {
            if !e.is_fatal_to_link() {
                let _ = send_error(&mut peer.stream, vocab, &e.to_string());
            }
            // Unread book bytes may still be in flight.
            peer.desynced = true;
            Err(e)
        }
    }
}

fn delete_book<S: ByteStream>(dev: &mut Device, peer: &mut Peer<S>, frame: &Frame) -> Result<()> {
    let vocab = dev.config.vocabulary;
    if !dev.config.can_delete_books {
        return Err(reject(peer, vocab, ValidationError::DeleteNotPermitted));
    }
    let payload = frame.payload(&peer.rx);
    let (lpaths, batch): (Vec<String>, bool) = match json::find_string_array(payload, "lpaths") {
        Some(list) => (list.into_iter().map(str::to_string).collect(), true),
        None => (
            json::find_string(payload, "lpath").map(str::to_string).into_iter().collect(),
            false,
        ),
    };
    if lpaths.is_empty() {
        return Err(reject(peer, vocab, ValidationError::EmptyPath));
    }
    for lpath in &lpaths {
        if let Err(e) = check_lpath(lpath, &dev.config.extensions, dev.config.max_path_len) {
            return Err(reject(peer, vocab, e));
        }
    }

    for lpath in &lpaths {
        let path = dev.config.book_path(lpath);
        if !dev.storage.exists(&path) {
            debug!("Delete of missing {} treated as done", path);
            continue;
        }
        if let Err(e) = dev.storage.remove(&path) {
            let err = SyncError::Storage(format!("remove {path}: {e}"));
            send_error(&mut peer.stream, vocab, &err.to_string())?;
            return Err(err);
        }
        info!("Deleted {}", path);
        dev.callbacks.book_deleted(&path);
    }

    ok(peer, vocab, json!({}))?;
    if batch {
        // One acknowledgement per book for the multi-delete exchange.
        for lpath in &lpaths {
            ok(peer, vocab, json!({ "lpath": lpath, "uuid": "" }))?;
        }
    }
    Ok(())
}
