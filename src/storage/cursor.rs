//! Streaming reads.
//!
//! A producer task pages through a table by `_seq`, re-checks every row
//! against the full filter and feeds a bounded channel. One producer and a
//! FIFO channel keep results in order.

use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use super::{FindOptions, Namespace, Storage, StorageError, StorageResult};
use crate::backend::Predicate;
use crate::bson::{encode_document, Document};

pub(crate) struct ScanPlan {
    pub ns: Namespace,
    pub table_ref: String,
    pub predicate: Predicate,
    pub opts: FindOptions,
}

/// Ordered stream of query results. Dropping it stops the producer.
pub struct DocumentStream {
    rx: Option<mpsc::Receiver<StorageResult<Document>>>,
    peeked: Option<StorageResult<Document>>,
    _guard: Option<DropGuard>,
}

impl DocumentStream {
    pub fn empty() -> Self {
        Self {
            rx: None,
            peeked: None,
            _guard: None,
        }
    }

    pub async fn next(&mut self) -> Option<StorageResult<Document>> {
        if let Some(item) = self.peeked.take() {
            return Some(item);
        }
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Some(item) => Some(item),
            None => {
                self.rx = None;
                None
            }
        }
    }

    /// Waits until the next result is known and reports whether there is none.
    pub async fn is_exhausted(&mut self) -> bool {
        if self.peeked.is_some() {
            return false;
        }
        match self.next().await {
            Some(item) => {
                self.peeked = Some(item);
                false
            }
            None => true,
        }
    }

    /// Up to `max_docs` documents whose encoded sizes stay within
    /// `max_bytes`. The first document is always taken. An error ends the
    /// batch and is returned.
    pub async fn next_batch(
        &mut self,
        max_docs: usize,
        max_bytes: usize,
    ) -> StorageResult<Vec<Document>> {
        let mut batch = Vec::with_capacity(max_docs.min(1024));
        let mut bytes = 0;
        while batch.len() < max_docs {
            let doc = match self.next().await {
                Some(item) => item?,
                None => break,
            };
            let size = encode_document(&doc).len();
            if !batch.is_empty() && bytes + size > max_bytes {
                self.peeked = Some(Ok(doc));
                break;
            }
            bytes += size;
            batch.push(doc);
        }
        Ok(batch)
    }

    pub async fn collect_all(mut self) -> StorageResult<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

pub(crate) fn spawn_scan(storage: Storage, plan: ScanPlan) -> DocumentStream {
    let token = storage.cancel_token().child_token();
    let capacity = storage.config().read_ahead.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let scoped = storage.scoped(token.clone());

    tokio::spawn(async move {
        let ns = plan.ns.clone();
        match produce(&scoped, plan, &tx).await {
            Ok(()) => {}
            // Dropped mid-read, possibly by another process.
            Err(StorageError::NamespaceNotFound(_)) => {
                scoped.catalog().forget_collection(&ns);
                tracing::debug!(ns = %ns, "Scan ended early, collection is gone");
            }
            // Abandoned by the consumer.
            Err(StorageError::Cancelled) => {
                tracing::debug!(ns = %ns, "Scan ended early");
            }
            Err(e) => {
                tracing::warn!(ns = %ns, "Scan failed: {}", e);
                let _ = tx.send(Err(e)).await;
            }
        }
    });

    DocumentStream {
        rx: Some(rx),
        peeked: None,
        _guard: Some(token.drop_guard()),
    }
}

async fn produce(
    storage: &Storage,
    plan: ScanPlan,
    tx: &mpsc::Sender<StorageResult<Document>>,
) -> StorageResult<()> {
    let ScanPlan {
        table_ref,
        predicate,
        opts,
        ..
    } = plan;
    let page_size = storage.config().page_size.max(1);

    let ordered = opts.sort.as_ref().filter(|s| !s.is_natural() && !s.is_empty());
    let ascending = opts
        .sort
        .as_ref()
        .map(|s| s.natural_ascending())
        .unwrap_or(true);

    let mut emitter = Emitter {
        tx,
        skip: opts.skip,
        remaining: opts.limit,
        opts: &opts,
    };

    if let Some(sort) = ordered {
        let mut all = Vec::new();
        let mut after = 0;
        loop {
            let page = storage
                .scan_page(&table_ref, &predicate, after, true, page_size)
                .await?;
            let done = page.len() < page_size;
            for (seq, doc) in page {
                after = seq;
                if opts.filter.matches(&doc) {
                    all.push(doc);
                }
            }
            if done {
                break;
            }
        }
        sort.sort(&mut all);
        for doc in all {
            if !emitter.emit(doc).await? {
                break;
            }
        }
        return Ok(());
    }

    let mut after = if ascending { 0 } else { i64::MAX };
    loop {
        let page = storage
            .scan_page(&table_ref, &predicate, after, ascending, page_size)
            .await?;
        let done = page.len() < page_size;
        for (seq, doc) in page {
            after = seq;
            if opts.filter.matches(&doc) && !emitter.emit(doc).await? {
                return Ok(());
            }
        }
        if done {
            return Ok(());
        }
    }
}

struct Emitter<'a> {
    tx: &'a mpsc::Sender<StorageResult<Document>>,
    skip: usize,
    remaining: Option<usize>,
    opts: &'a FindOptions,
}

impl Emitter<'_> {
    /// Applies skip, limit and projection. Returns `false` once no more
    /// documents are wanted.
    async fn emit(&mut self, doc: Document) -> StorageResult<bool> {
        if self.remaining == Some(0) {
            return Ok(false);
        }
        if self.skip > 0 {
            self.skip -= 1;
            return Ok(true);
        }
        let doc = match &self.opts.projection {
            Some(p) => p.apply(&doc),
            None => doc,
        };
        if self.tx.send(Ok(doc)).await.is_err() {
            return Err(StorageError::Cancelled);
        }
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
            if *n == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
