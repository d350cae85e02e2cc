//! Device configuration: what the device tells the desktop application about itself, and the
//! local policy applied to what the desktop application sends.

use std::time::Duration;

use serde::Deserialize;

use crate::discovery::ReplyStyle;
use crate::error::{Result, SyncError};
use crate::protocol::{Vocabulary, BROADCAST_PORTS};
use crate::transfer::TransferMode;
use crate::validate::{DEFAULT_MAX_BOOK_SIZE, DEFAULT_MAX_PATH_LEN};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Name shown in the desktop application's device list.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Accepted book extensions, without the dot. Matched case-insensitively.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub can_delete_books: bool,
    #[serde(default)]
    pub password: Option<String>,
    /// Directory under the storage root that receives books.
    #[serde(default = "default_books_dir")]
    pub books_dir: String,
    #[serde(default = "default_max_book_size")]
    pub max_book_size: u64,
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,
    #[serde(default = "default_discovery_ports")]
    pub discovery_ports: Vec<u16>,
    /// Opcode spelling used for outgoing messages.
    #[serde(default)]
    pub vocabulary: Vocabulary,
    /// Force one book transfer sub-protocol instead of negotiating it per book.
    #[serde(default)]
    pub transfer_mode: Option<TransferMode>,
    #[serde(default)]
    pub discovery_reply: ReplyStyle,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on every blocking receive once connected.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Stable identifier reported in GET_DEVICE_INFORMATION. Generated per context when unset.
    #[serde(default)]
    pub store_uuid: Option<String>,
}

fn default_name() -> String {
    "sdlink".into()
}
fn default_manufacturer() -> String {
    "sdlink".into()
}
fn default_model() -> String {
    "Linux Reader".into()
}
fn default_extensions() -> Vec<String> {
    ["epub", "pdf", "txt", "mobi", "azw3"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_true() -> bool {
    true
}
fn default_books_dir() -> String {
    "Books".into()
}
fn default_max_book_size() -> u64 {
    DEFAULT_MAX_BOOK_SIZE
}
fn default_max_path_len() -> usize {
    DEFAULT_MAX_PATH_LEN
}
fn default_discovery_ports() -> Vec<u16> {
    BROADCAST_PORTS.to_vec()
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_io_timeout_ms() -> u64 {
    30_000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            manufacturer: default_manufacturer(),
            model: default_model(),
            extensions: default_extensions(),
            can_delete_books: true,
            password: None,
            books_dir: default_books_dir(),
            max_book_size: default_max_book_size(),
            max_path_len: default_max_path_len(),
            discovery_ports: default_discovery_ports(),
            vocabulary: Vocabulary::default(),
            transfer_mode: None,
            discovery_reply: ReplyStyle::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            store_uuid: None,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::InvalidArgument("device name is empty".into()));
        }
        if self.extensions.is_empty() || self.extensions.iter().any(|e| e.trim().is_empty()) {
            return Err(SyncError::InvalidArgument(
                "extension list is empty or has a blank entry".into(),
            ));
        }
        if self.max_book_size == 0 || self.max_path_len == 0 {
            return Err(SyncError::InvalidArgument("size limits must be non-zero".into()));
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(SyncError::InvalidArgument("timeouts must be non-zero".into()));
        }
        if self.books_dir.starts_with('/') || self.books_dir.split('/').any(|s| s == "..") {
            return Err(SyncError::InvalidArgument(format!(
                "books_dir must be relative: {}",
                self.books_dir
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Storage path for a validated lpath.
    pub fn book_path(&self, lpath: &str) -> String {
        let dir = self.books_dir.trim_matches('/');
        if dir.is_empty() {
            lpath.to_string()
        } else {
            format!("{dir}/{lpath}")
        }
    }
}
