use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::Document;

type Printer = dyn Fn(&Document) -> String + Send + Sync;

struct Entry {
    document: Weak<Document>,
    text: Arc<str>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.document.strong_count() > 0
    }
}

/// Printed text of operation documents, keyed by the identity of the
/// `Arc<Document>` rather than its contents.
///
/// Only a weak reference to each document is held: once every other owner
/// drops the document the entry is dead, and dead entries are purged on the
/// next insert.
pub struct DocumentPrintCache {
    printer: Box<Printer>,
    entries: Mutex<HashMap<usize, Entry>>,
}

impl DocumentPrintCache {
    pub fn new() -> Self {
        Self::with_printer(|document: &Document| document.to_string())
    }

    pub fn with_printer<F>(printer: F) -> Self
    where
        F: Fn(&Document) -> String + Send + Sync + 'static,
    {
        DocumentPrintCache {
            printer: Box::new(printer),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn print(&self, document: &Arc<Document>) -> Arc<str> {
        let key = Arc::as_ptr(document) as usize;

        if let Some(entry) = self.entries().get(&key) {
            // A live weak pointing at this address is this very allocation.
            if entry.is_live() && std::ptr::eq(entry.document.as_ptr(), Arc::as_ptr(document)) {
                return entry.text.clone();
            }
        }

        let text: Arc<str> = (self.printer)(document).into();

        let mut entries = self.entries();
        entries.retain(|_, entry| entry.is_live());
        entries.insert(
            key,
            Entry {
                document: Arc::downgrade(document),
                text: text.clone(),
            },
        );

        text
    }

    /// Number of entries whose document is still alive.
    pub fn live_entries(&self) -> usize {
        self.entries().values().filter(|entry| entry.is_live()).count()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<usize, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DocumentPrintCache {
    fn default() -> Self {
        Self::new()
    }
}
