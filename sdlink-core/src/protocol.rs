//! Smart-device wire protocol: opcodes, their two wire vocabularies, and protocol constants.

use serde::Deserialize;

/// Highest server protocol version this device understands. Newer servers are accepted with a warning.
pub const PROTOCOL_VERSION: i64 = 1;

/// Client version number reported in the capability reply.
pub const CC_VERSION_NUMBER: u32 = 128;

/// Well-known UDP ports the desktop application broadcasts to.
pub const BROADCAST_PORTS: [u16; 5] = [54982, 48123, 39001, 44044, 59678];

/// Default TCP port the device listens on / advertises.
pub const DEFAULT_PORT: u16 = 9090;

/// Hard ceiling on a single framed message (bytes after the length prefix).
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024; // 1 MiB

/// All protocol messages, independent of how the opcode is spelled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ok,
    SetCalibreDeviceInfo,
    SetCalibreDeviceName,
    GetDeviceInformation,
    TotalSpace,
    FreeSpace,
    GetBookCount,
    SendBooklists,
    SendBook,
    GetInitializationInfo,
    /// Chunk header in the framed transfer sub-protocol. Has no numeric code.
    BookData,
    BookDone,
    Noop,
    DeleteBook,
    GetBookFileSegment,
    GetBookMetadata,
    SendBookMetadata,
    DisplayMessage,
    CalibreBusy,
    SetLibraryInfo,
    Error,
}

/// (opcode, string name, numeric code)
const TABLE: &[(Opcode, &str, Option<u8>)] = &[
    (Opcode::Ok, "OK", Some(0)),
    (Opcode::SetCalibreDeviceInfo, "SET_CALIBRE_DEVICE_INFO", Some(1)),
    (Opcode::SetCalibreDeviceName, "SET_CALIBRE_DEVICE_NAME", Some(2)),
    (Opcode::GetDeviceInformation, "GET_DEVICE_INFORMATION", Some(3)),
    (Opcode::TotalSpace, "TOTAL_SPACE", Some(4)),
    (Opcode::FreeSpace, "FREE_SPACE", Some(5)),
    (Opcode::GetBookCount, "GET_BOOK_COUNT", Some(6)),
    (Opcode::SendBooklists, "SEND_BOOKLISTS", Some(7)),
    (Opcode::SendBook, "SEND_BOOK", Some(8)),
    (Opcode::GetInitializationInfo, "GET_INITIALIZATION_INFO", Some(9)),
    (Opcode::BookData, "BOOK_DATA", None),
    (Opcode::BookDone, "BOOK_DONE", Some(11)),
    (Opcode::Noop, "NOOP", Some(12)),
    (Opcode::DeleteBook, "DELETE_BOOK", Some(13)),
    (Opcode::GetBookFileSegment, "GET_BOOK_FILE_SEGMENT", Some(14)),
    (Opcode::GetBookMetadata, "GET_BOOK_METADATA", Some(15)),
    (Opcode::SendBookMetadata, "SEND_BOOK_METADATA", Some(16)),
    (Opcode::DisplayMessage, "DISPLAY_MESSAGE", Some(17)),
    (Opcode::CalibreBusy, "CALIBRE_BUSY", Some(18)),
    (Opcode::SetLibraryInfo, "SET_LIBRARY_INFO", Some(19)),
    (Opcode::Error, "ERROR", Some(20)),
];

impl Opcode {
    pub fn name(self) -> &'static str {
        TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("UNKNOWN")
    }

    pub fn code(self) -> Option<u8> {
        TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .and_then(|(_, _, code)| *code)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        TABLE
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(op, _, _)| *op)
    }

    pub fn from_code(code: u8) -> Option<Self> {
        TABLE
            .iter()
            .find(|(_, _, c)| *c == Some(code))
            .map(|(op, _, _)| *op)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How opcodes are spelled on the wire. Decoding accepts either spelling; encoding uses this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vocabulary {
    /// `["GET_INITIALIZATION_INFO", {...}]`
    #[default]
    Named,
    /// `[9, {...}]`
    Numeric,
}

impl Vocabulary {
    /// Wire token for `op`: a quoted name or a bare decimal code.
    /// Falls back to the quoted name when the numeric table has no code for `op`.
    pub fn token(self, op: Opcode) -> String {
        match (self, op.code()) {
            (Vocabulary::Numeric, Some(code)) => code.to_string(),
            _ => format!("\"{}\"", op.name()),
        }
    }
}

/// A decoded opcode token: either resolved, or kept verbatim for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpcodeToken {
    Known(Opcode),
    Unknown(String),
}

impl OpcodeToken {
    /// Resolve a raw token (name without quotes, or decimal digits).
    pub fn parse(raw: &str, quoted: bool) -> Self {
        let known = if quoted {
            Opcode::from_name(raw)
        } else {
            raw.parse::<u8>().ok().and_then(Opcode::from_code)
        };
        match known {
            Some(op) => OpcodeToken::Known(op),
            None => OpcodeToken::Unknown(raw.to_string()),
        }
    }
}
