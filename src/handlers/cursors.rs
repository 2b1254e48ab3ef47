//! Server-side cursors owned by one session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::storage::{DocumentStream, Namespace};

pub struct Cursor {
    pub ns: Namespace,
    pub stream: DocumentStream,
    /// Catalog generation of `ns` when the cursor was opened.
    pub generation: u64,
    last_used: Instant,
}

impl Cursor {
    pub fn new(ns: Namespace, stream: DocumentStream, generation: u64) -> Self {
        Self {
            ns,
            stream,
            generation,
            last_used: Instant::now(),
        }
    }
}

pub struct CursorRegistry {
    cursors: HashMap<i64, Cursor>,
    timeout: Duration,
}

impl CursorRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cursors: HashMap::new(),
            timeout,
        }
    }

    /// Stores `cursor` under a fresh non-zero id.
    pub fn insert(&mut self, mut cursor: Cursor) -> i64 {
        self.expire();
        cursor.last_used = Instant::now();
        loop {
            let id = rand::random::<i64>() & i64::MAX;
            if id != 0 && !self.cursors.contains_key(&id) {
                self.cursors.insert(id, cursor);
                return id;
            }
        }
    }

    /// Removes a live cursor for use; put it back with [`restore`](Self::restore).
    pub fn take(&mut self, id: i64) -> Option<Cursor> {
        self.expire();
        self.cursors.remove(&id)
    }

    pub fn restore(&mut self, id: i64, mut cursor: Cursor) {
        cursor.last_used = Instant::now();
        self.cursors.insert(id, cursor);
    }

    pub fn kill(&mut self, id: i64) -> bool {
        self.cursors.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Drops cursors idle for longer than the timeout.
    pub fn expire(&mut self) {
        let timeout = self.timeout;
        let before = self.cursors.len();
        self.cursors.retain(|_, c| c.last_used.elapsed() <= timeout);
        let expired = before - self.cursors.len();
        if expired > 0 {
            tracing::debug!(expired, "Expired idle cursors");
        }
    }
}
