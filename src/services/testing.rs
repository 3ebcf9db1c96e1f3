//! Shared fixtures for service tests: a throwaway SQLite database, an index
//! wrapper that fails on demand, and a fully wired set of services.

use super::{
    context::OpContext,
    image_service::ImageService,
    index_gateway::{IndexError, IndexGateway, IndexResult, SearchHits},
    memory_index::MemoryIndex,
    object_store::LocalObjectStore,
    product_service::ProductService,
    reconciler::{Reconciler, RepairQueue},
    record_store::RecordStore,
};
use crate::models::{product::CreateProductRequest, search::SearchDocument};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct TestDb {
    pub pool: Arc<SqlitePool>,
    _dir: TempDir,
}

impl TestDb {
    pub fn records(&self) -> RecordStore {
        RecordStore::new(self.pool.clone())
    }
}

/// Fresh on-disk database with the schema applied.
pub async fn database() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("catalog.db").display());
    let pool = Arc::new(RecordStore::connect(&url, 4).await.unwrap());
    RecordStore::new(pool.clone()).migrate().await.unwrap();
    TestDb { pool, _dir: dir }
}

/// MemoryIndex that can be told to fail upserts, deletes or searches.
#[derive(Default)]
pub struct FaultyIndex {
    inner: MemoryIndex,
    upsert_failures: AtomicUsize,
    fail_deletes: AtomicBool,
    fail_searches: AtomicBool,
}

impl FaultyIndex {
    pub fn memory(&self) -> &MemoryIndex {
        &self.inner
    }

    pub fn fail_next_upserts(&self, count: usize) {
        self.upsert_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_searches(&self, fail: bool) {
        self.fail_searches.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> IndexError {
        IndexError::Backend {
            status: 503,
            body: "injected failure".into(),
        }
    }
}

#[async_trait]
impl IndexGateway for FaultyIndex {
    async fn upsert(&self, id: &str, document: &SearchDocument) -> IndexResult<()> {
        let tripped = self
            .upsert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(Self::unavailable());
        }
        self.inner.upsert(id, document).await
    }

    async fn delete_by_id(&self, id: &str) -> IndexResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.delete_by_id(id).await
    }

    async fn search(&self, query: &Value) -> IndexResult<SearchHits> {
        if self.fail_searches.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.search(query).await
    }

    async fn ping(&self) -> IndexResult<()> {
        self.inner.ping().await
    }

    fn backend(&self) -> &'static str {
        "faulty-memory"
    }
}

pub const TEST_BUCKET: &str = "products";
pub const TEST_PRESIGN_TTL: Duration = Duration::from_secs(3600);

pub struct Harness {
    pub db: TestDb,
    pub records: RecordStore,
    pub index: Arc<FaultyIndex>,
    pub objects: Arc<LocalObjectStore>,
    pub products: ProductService,
    pub images: ImageService,
    pub reconciler: Reconciler,
    pub admin: Uuid,
    pub shutdown: CancellationToken,
    repairs: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    _objects_dir: TempDir,
}

impl Harness {
    pub fn ctx(&self) -> OpContext {
        OpContext::with_timeout(Duration::from_secs(10))
    }

    /// Product ids queued for repair so far.
    pub fn drain_repairs(&self) -> Vec<Uuid> {
        let mut guard = self.repairs.lock().unwrap();
        let receiver = guard.as_mut().expect("repair queue is owned by the worker");
        let mut ids = Vec::new();
        while let Ok(id) = receiver.try_recv() {
            ids.push(id);
        }
        ids
    }
}

pub async fn harness() -> Harness {
    build(false).await
}

/// Harness whose repair queue is drained by a running reconciler task.
pub async fn harness_with_worker() -> Harness {
    build(true).await
}

async fn build(spawn_worker: bool) -> Harness {
    let db = database().await;
    let records = db.records();
    let index = Arc::new(FaultyIndex::default());
    let objects_dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(LocalObjectStore::new(
        objects_dir.path(),
        "http://localhost:3000",
        "test-secret",
    ));

    let (repair_queue, receiver) = RepairQueue::channel();
    let products = ProductService::new(records.clone(), index.clone(), repair_queue);
    let images = ImageService::new(
        records.clone(),
        objects.clone(),
        TEST_BUCKET,
        TEST_PRESIGN_TTL,
    );
    let reconciler = Reconciler::new(records.clone(), index.clone());
    let shutdown = CancellationToken::new();

    let repairs = if spawn_worker {
        let _ = reconciler.clone().spawn(receiver, None, shutdown.clone());
        None
    } else {
        Some(receiver)
    };

    Harness {
        db,
        records,
        index,
        objects,
        products,
        images,
        reconciler,
        admin: Uuid::new_v4(),
        shutdown,
        repairs: Mutex::new(repairs),
        _objects_dir: objects_dir,
    }
}

pub fn sample_request(name: &str, quantity: i64) -> CreateProductRequest {
    CreateProductRequest {
        name: name.to_string(),
        description: Some(format!("{} description", name)),
        category: Some(json!(["general"])),
        brand: "Acme".into(),
        color: Some(json!(["black"])),
        specs: Some(json!({"size": "m"})),
        price: Some(Decimal::new(1999, 2)),
        quantity: Some(quantity),
    }
}

/// Index document whose product was never stored.
pub fn orphan_document() -> SearchDocument {
    let now = Utc::now();
    SearchDocument {
        id: Uuid::new_v4().to_string(),
        name: "Orphan".into(),
        description: String::new(),
        category: Value::Null,
        brand: "Ghost".into(),
        color: Value::Null,
        specs: Value::Null,
        price: Decimal::ONE,
        quantity: 0,
        created_by: Uuid::nil(),
        created_at: now,
        updated_at: now,
    }
}
