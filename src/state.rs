use crate::services::{
    context::OpContext, image_service::ImageService, index_gateway::SharedIndex,
    object_store::ObjectStorage, product_service::ProductService, reconciler::Reconciler,
    record_store::RecordStore,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub products: ProductService,
    pub images: ImageService,
    pub reconciler: Reconciler,
    pub records: RecordStore,
    pub index: SharedIndex,
    pub objects: Arc<dyn ObjectStorage>,
    /// Role a caller must carry to mutate the catalog.
    pub admin_role: Arc<str>,
    pub request_timeout: Duration,
    /// Fires on server shutdown; in-flight operations abort before commit.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// A fresh per-request context bounded by the configured timeout.
    pub fn context(&self) -> OpContext {
        OpContext::with_timeout(self.request_timeout).with_token(self.shutdown.child_token())
    }
}

#[cfg(test)]
impl AppState {
    /// State wired to the services of a test harness.
    pub fn for_harness(harness: &crate::services::testing::Harness) -> Self {
        Self {
            products: harness.products.clone(),
            images: harness.images.clone(),
            reconciler: harness.reconciler.clone(),
            records: harness.records.clone(),
            index: harness.index.clone(),
            objects: harness.objects.clone(),
            admin_role: Arc::from("admin"),
            request_timeout: Duration::from_secs(10),
            shutdown: harness.shutdown.clone(),
        }
    }
}
