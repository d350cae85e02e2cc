//! Test doubles: an in-memory byte stream and an in-memory storage.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::protocol::{Opcode, Vocabulary};
use crate::storage::Storage;
use crate::transport::{ByteStream, CancelHandle};
use crate::wire;

/// Scripted input, captured output. Running out of input reads as a peer disconnect.
pub struct MemStream {
    input: Vec<u8>,
    pos: usize,
    pub output: Vec<u8>,
    pub cancel: CancelHandle,
}

impl MemStream {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input,
            pos: 0,
            output: Vec::new(),
            cancel: CancelHandle::new(),
        }
    }

    /// Input made of encoded frames followed by raw bytes.
    pub fn with_frames(frames: &[(Opcode, &str)], raw: &[u8]) -> Self {
        let mut input = Vec::new();
        for (op, payload) in frames {
            input.extend(wire::encode_frame(Vocabulary::Named, *op, payload).unwrap());
        }
        input.extend_from_slice(raw);
        Self::new(input)
    }

    pub fn push_frame(&mut self, op: Opcode, payload: &str) {
        self.input
            .extend(wire::encode_frame(Vocabulary::Named, op, payload).unwrap());
    }

    pub fn push_raw(&mut self, raw: &[u8]) {
        self.input.extend_from_slice(raw);
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Decode everything written so far as (opcode name, payload) pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut rest = &self.output[..];
        while !rest.is_empty() {
            let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
            let len: usize = std::str::from_utf8(&rest[..digits]).unwrap().parse().unwrap();
            let body = std::str::from_utf8(&rest[digits..digits + len]).unwrap();
            let (op, range) = wire::split_message(body).unwrap();
            let name = match op {
                crate::protocol::OpcodeToken::Known(op) => op.name().to_string(),
                crate::protocol::OpcodeToken::Unknown(raw) => raw,
            };
            out.push((name, body[range].to_string()));
            rest = &rest[digits + len..];
        }
        out
    }
}

impl ByteStream for MemStream {
    fn send_exact(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.extend_from_slice(bytes);
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if self.input.len() - self.pos < buf.len() {
            self.pos = self.input.len();
            return Err(SyncError::Disconnected);
        }
        buf.copy_from_slice(&self.input[self.pos..self.pos + buf.len()]);
        self.pos += buf.len();
        Ok(())
    }
}

/// Flat in-memory file map. Directories are tracked only so `create_dir_all` calls can be checked.
#[derive(Clone, Default)]
pub struct MemStorage {
    pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub dirs: Arc<Mutex<HashSet<String>>>,
    pub fail_writes_after: Option<usize>,
    /// `create` and `remove` fail with PermissionDenied.
    pub read_only: bool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn insert(&self, path: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
    }
}

struct MemWriter {
    path: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    budget: Option<usize>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget < buf.len() {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            *budget -= buf.len();
        }
        self.files
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Storage for MemStorage {
    fn open_read(&self, path: &str) -> io::Result<Box<dyn io::Read + Send>> {
        let bytes = self
            .file(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, path.to_string()));
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), Vec::new());
        Ok(Box::new(MemWriter {
            path: path.to_string(),
            files: self.files.clone(),
            budget: self.fail_writes_after,
        }))
    }

    fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path) || self.dirs.lock().unwrap().contains(path)
    }

    fn create_dir_all(&self, path: &str) -> io::Result<()> {
        self.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, path.to_string()));
        }
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }
}
