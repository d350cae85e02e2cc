//! Caller hooks. Every hook is optional; an absent progress hook never stops a transfer.

use std::fmt;

use crate::transfer::BookMeta;

type ProgressFn = Box<dyn FnMut(u64, u64) -> bool + Send>;
type BookReceivedFn = Box<dyn FnMut(&BookMeta, &str) + Send>;
type MessageFn = Box<dyn FnMut(&str) + Send>;
type BookDeletedFn = Box<dyn FnMut(&str) + Send>;

#[derive(Default)]
pub struct Callbacks {
    progress: Option<ProgressFn>,
    book_received: Option<BookReceivedFn>,
    message: Option<MessageFn>,
    book_deleted: Option<BookDeletedFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `f(received, total)`; return false to abort the transfer.
    pub fn on_progress(mut self, f: impl FnMut(u64, u64) -> bool + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// `f(metadata, storage path)` after a book is fully written.
    pub fn on_book_received(mut self, f: impl FnMut(&BookMeta, &str) + Send + 'static) -> Self {
        self.book_received = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    pub fn on_book_deleted(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.book_deleted = Some(Box::new(f));
        self
    }

    pub(crate) fn progress(&mut self, received: u64, total: u64) -> bool {
        self.progress.as_mut().map_or(true, |f| f(received, total))
    }

    pub(crate) fn book_received(&mut self, meta: &BookMeta, path: &str) {
        if let Some(f) = self.book_received.as_mut() {
            f(meta, path);
        }
    }

    pub(crate) fn message(&mut self, text: &str) {
        if let Some(f) = self.message.as_mut() {
            f(text);
        }
    }

    pub(crate) fn book_deleted(&mut self, path: &str) {
        if let Some(f) = self.book_deleted.as_mut() {
            f(path);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("progress", &self.progress.is_some())
            .field("book_received", &self.book_received.is_some())
            .field("message", &self.message.is_some())
            .field("book_deleted", &self.book_deleted.is_some())
            .finish()
    }
}
