//! src/services/reconciler.rs
//!
//! Closes the desync window between the record store and the search index.
//! Product ids whose post-commit index write failed arrive on the repair
//! queue and are re-synced one at a time. A periodic sweep re-upserts every
//! product and removes index documents whose product no longer exists.

use super::{
    index_gateway::SharedIndex, query_compiler::id_scan, record_store::RecordStore,
};
use crate::{
    errors::{CatalogError, CatalogResult},
    models::search::SearchDocument,
};
use serde::Serialize;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: i64 = 200;

/// Sending half of the repair queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RepairQueue {
    sender: mpsc::UnboundedSender<Uuid>,
}

impl RepairQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, product_id: Uuid) {
        if self.sender.send(product_id).is_err() {
            warn!(%product_id, "repair queue closed; product waits for the next sweep");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    Reindexed,
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reindexed: u64,
    pub orphans_removed: u64,
    pub failures: u64,
}

#[derive(Clone)]
pub struct Reconciler {
    records: RecordStore,
    index: SharedIndex,
    batch_size: i64,
}

impl Reconciler {
    pub fn new(records: RecordStore, index: SharedIndex) -> Self {
        Self {
            records,
            index,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Bring the index document of one product in line with the record store.
    #[instrument(skip(self))]
    pub async fn repair(&self, product_id: Uuid) -> CatalogResult<RepairOutcome> {
        let mut tx = self.records.begin().await?;
        let found = self.records.find_by_id(&mut tx, product_id).await;
        drop(tx);

        match found {
            Ok(product) => {
                let document = SearchDocument::from(&product);
                self.index
                    .upsert(&document.id, &document)
                    .await
                    .map_err(CatalogError::transport("re-indexing product"))?;
                Ok(RepairOutcome::Reindexed)
            }
            Err(CatalogError::NotFound { .. }) => {
                self.index
                    .delete_by_id(&product_id.to_string())
                    .await
                    .map_err(CatalogError::transport("removing stale index document"))?;
                Ok(RepairOutcome::Removed)
            }
            Err(err) => Err(err),
        }
    }

    /// Re-upsert every product, then delete index documents with no product.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> CatalogResult<SweepReport> {
        let mut report = SweepReport::default();

        let mut offset = 0;
        loop {
            let mut tx = self.records.begin().await?;
            let (products, _) = self
                .records
                .list_page(&mut tx, self.batch_size, offset)
                .await?;
            drop(tx);

            for product in &products {
                let document = SearchDocument::from(product);
                match self.index.upsert(&document.id, &document).await {
                    Ok(()) => report.reindexed += 1,
                    Err(err) => {
                        warn!(product_id = %product.id, error = %err, "sweep upsert failed");
                        report.failures += 1;
                    }
                }
            }
            if (products.len() as i64) < self.batch_size {
                break;
            }
            offset += self.batch_size;
        }

        let mut cursor: Option<String> = None;
        loop {
            let hits = self
                .index
                .search(&id_scan(cursor.as_deref(), self.batch_size as u64))
                .await
                .map_err(CatalogError::transport("scanning index ids"))?;

            let ids: Vec<Uuid> = hits
                .documents
                .iter()
                .filter_map(|doc| Uuid::parse_str(&doc.id).ok())
                .collect();
            let mut tx = self.records.begin().await?;
            let existing = self.records.existing_ids(&mut tx, &ids).await?;
            drop(tx);

            for doc in &hits.documents {
                let live = Uuid::parse_str(&doc.id).is_ok_and(|id| existing.contains(&id));
                if live {
                    continue;
                }
                match self.index.delete_by_id(&doc.id).await {
                    Ok(()) => report.orphans_removed += 1,
                    Err(err) => {
                        warn!(document_id = %doc.id, error = %err, "orphan delete failed");
                        report.failures += 1;
                    }
                }
            }

            let Some(last) = hits.documents.last() else {
                break;
            };
            if (hits.documents.len() as i64) < self.batch_size {
                break;
            }
            cursor = Some(last.id.clone());
        }

        info!(
            reindexed = report.reindexed,
            orphans_removed = report.orphans_removed,
            failures = report.failures,
            "index sweep finished"
        );
        Ok(report)
    }

    /// Drain the repair queue and run periodic sweeps until `shutdown` fires.
    /// A `sweep_every` of `None` disables the periodic sweep.
    pub fn spawn(
        self,
        mut queue: mpsc::UnboundedReceiver<Uuid>,
        sweep_every: Option<Duration>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = sweep_every.map(|period| {
                let mut ticker = time::interval_at(time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let tick = async {
                    match ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(product_id) = queue.recv() => {
                        match self.repair(product_id).await {
                            Ok(outcome) => debug!(%product_id, ?outcome, "repaired index document"),
                            Err(err) => warn!(%product_id, error = %err, "repair failed; sweep will retry"),
                        }
                    }
                    _ = tick => {
                        if let Err(err) = self.sweep().await {
                            warn!(error = %err, "index sweep failed");
                        }
                    }
                }
            }
            debug!("reconciler stopped");
        })
    }
}
