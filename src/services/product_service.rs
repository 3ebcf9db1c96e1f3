//! src/services/product_service.rs
//!
//! ProductService: Orchestrates product writes across the record store and
//! the search index.
//!
//! - Create and update commit the relational write first, then upsert the
//!   index document. A failed upsert does not undo the commit; it surfaces as
//!   `IndexDesync` carrying the committed product, and the id is queued for
//!   repair.
//! - Delete removes the row, then the index document, and only then commits.
//!   A failed index delete rolls the row deletion back.
//! - Quantity decrements are single guarded UPDATE statements and never touch
//!   the index.

use super::{
    context::OpContext, index_gateway::SharedIndex, query_compiler, reconciler::RepairQueue,
    record_store::RecordStore,
};
use crate::{
    errors::{CatalogError, CatalogResult, Operation},
    models::{
        page::{PageMetadata, PageRequest},
        product::{CreateProductRequest, Product, UpdateProductRequest},
        search::{SearchDocument, SearchPage, SearchRequest},
        validation::{Rule, Violations, parse_uuid},
    },
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// One entry of a batch decrement. The id is kept raw so a malformed id
/// fails only its own entry.
#[derive(Debug, Clone)]
pub struct QuantityChange {
    pub product_id: String,
    pub quantity: i64,
}

#[derive(Debug)]
pub struct QuantityOutcome {
    pub product_id: String,
    pub result: CatalogResult<i64>,
}

#[derive(Debug)]
pub struct BatchDecrease {
    pub outcomes: Vec<QuantityOutcome>,
    /// False as soon as any entry failed.
    pub all_success: bool,
}

#[derive(Clone)]
pub struct ProductService {
    records: RecordStore,
    index: SharedIndex,
    repairs: RepairQueue,
}

impl ProductService {
    pub fn new(records: RecordStore, index: SharedIndex, repairs: RepairQueue) -> Self {
        Self {
            records,
            index,
            repairs,
        }
    }

    #[instrument(skip(self, ctx))]
    pub async fn list(
        &self,
        ctx: &OpContext,
        page: PageRequest,
    ) -> CatalogResult<(Vec<Product>, PageMetadata)> {
        ctx.guard(async {
            let mut tx = self.records.begin().await?;
            let (items, total) = self
                .records
                .list_page(&mut tx, page.limit, page.offset())
                .await?;
            Ok((items, PageMetadata::new(page, total)))
        })
        .await
    }

    #[instrument(skip(self, ctx))]
    pub async fn get(&self, ctx: &OpContext, id: Uuid) -> CatalogResult<Product> {
        ctx.guard(async {
            let mut tx = self.records.begin().await?;
            self.records.find_by_id(&mut tx, id).await
        })
        .await
    }

    /// Products for every id that exists; unknown ids are skipped.
    #[instrument(skip(self, ctx, ids), fields(count = ids.len()))]
    pub async fn get_many(&self, ctx: &OpContext, ids: &[Uuid]) -> CatalogResult<Vec<Product>> {
        ctx.guard(async {
            let mut tx = self.records.begin().await?;
            self.records.find_many(&mut tx, ids).await
        })
        .await
    }

    /// Query the index only. Results are index projections, not live rows.
    #[instrument(skip(self, ctx, request))]
    pub async fn search(&self, ctx: &OpContext, request: &SearchRequest) -> CatalogResult<SearchPage> {
        let page = PageRequest::new(request.page, request.limit);
        let query = query_compiler::compile(request);
        debug!(%query, "compiled search query");

        let hits = ctx
            .guard(async {
                self.index
                    .search(&query)
                    .await
                    .map_err(CatalogError::transport("searching product index"))
            })
            .await?;

        Ok(SearchPage {
            items: hits.documents,
            total: hits.total,
            page: page.page,
            size: page.limit,
        })
    }

    #[instrument(skip(self, ctx, request))]
    pub async fn create(
        &self,
        ctx: &OpContext,
        created_by: Uuid,
        request: CreateProductRequest,
    ) -> CatalogResult<Product> {
        request.validate()?;
        let product = Product::from_request(request, created_by);

        let tx = ctx
            .guard(async {
                let mut tx = self.records.begin_write().await?;
                self.records.create(&mut tx, &product).await?;
                Ok(tx)
            })
            .await?;
        self.records.commit(tx).await?;
        info!(product_id = %product.id, "product created");

        self.index_committed(ctx, Operation::Create, product).await
    }

    #[instrument(skip(self, ctx, request))]
    pub async fn update(
        &self,
        ctx: &OpContext,
        id: Uuid,
        request: UpdateProductRequest,
    ) -> CatalogResult<Product> {
        let (tx, product) = ctx
            .guard(async {
                let mut tx = self.records.begin_write().await?;
                let mut product = self.records.find_by_id(&mut tx, id).await?;
                request.validate()?;
                request.apply_to(&mut product);
                self.records.save(&mut tx, &product).await?;
                Ok((tx, product))
            })
            .await?;
        self.records.commit(tx).await?;
        info!(product_id = %product.id, "product updated");

        self.index_committed(ctx, Operation::Update, product).await
    }

    /// Delete a product, its images and its index document.
    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, ctx: &OpContext, id: Uuid) -> CatalogResult<Product> {
        let (tx, product) = ctx
            .guard(async {
                let mut tx = self.records.begin_write().await?;
                let product = self.records.find_by_id(&mut tx, id).await?;
                self.records.delete(&mut tx, &product).await?;
                self.index
                    .delete_by_id(&product.id.to_string())
                    .await
                    .map_err(CatalogError::transport("removing product from search index"))?;
                Ok((tx, product))
            })
            .await?;
        self.records.commit(tx).await?;
        info!(product_id = %product.id, images = product.images.len(), "product deleted");
        Ok(product)
    }

    /// Subtract `amount` from the stored quantity. Returns the new quantity.
    #[instrument(skip(self, ctx))]
    pub async fn decrease_quantity(
        &self,
        ctx: &OpContext,
        id: Uuid,
        amount: i64,
    ) -> CatalogResult<i64> {
        if amount <= 0 {
            return Err(Violations::single("quantity", Rule::Positive).into());
        }
        ctx.guard(self.records.decrement_quantity(id, amount)).await
    }

    /// Apply each change independently. Earlier successes stay applied when a
    /// later entry fails.
    #[instrument(skip(self, ctx, changes), fields(count = changes.len()))]
    pub async fn decrease_quantity_batch(
        &self,
        ctx: &OpContext,
        changes: Vec<QuantityChange>,
    ) -> CatalogResult<BatchDecrease> {
        if changes.is_empty() {
            return Err(Violations::single("items", Rule::Required).into());
        }

        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            let result = match parse_uuid("product_id", &change.product_id) {
                Ok(id) => self.decrease_quantity(ctx, id, change.quantity).await,
                Err(violations) => Err(violations.into()),
            };
            if let Err(err) = &result {
                debug!(product_id = %change.product_id, error = %err, "batch entry failed");
            }
            outcomes.push(QuantityOutcome {
                product_id: change.product_id,
                result,
            });
        }

        let all_success = outcomes.iter().all(|o| o.result.is_ok());
        Ok(BatchDecrease {
            outcomes,
            all_success,
        })
    }

    /// Upsert the index document of a product whose write already committed.
    ///
    /// Runs even if `ctx` has finished; the row is durable either way.
    async fn index_committed(
        &self,
        ctx: &OpContext,
        operation: Operation,
        product: Product,
    ) -> CatalogResult<Product> {
        if ctx.is_done() {
            debug!(product_id = %product.id, "context finished after commit; indexing anyway");
        }

        let document = SearchDocument::from(&product);
        match self.index.upsert(&document.id, &document).await {
            Ok(()) => Ok(product),
            Err(source) => {
                warn!(
                    product_id = %product.id,
                    %operation,
                    error = %source,
                    "index upsert failed after commit; queued for repair"
                );
                self.repairs.enqueue(product.id);
                Err(CatalogError::IndexDesync {
                    operation,
                    product: Box::new(product),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ErrorKind,
        services::testing::{self, sample_request},
    };
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::{collections::HashSet, sync::Arc, time::Duration};

    #[tokio::test]
    async fn create_issues_fresh_ids_and_get_returns_same_product() {
        let h = testing::harness().await;
        let mut seen = HashSet::new();
        for i in 0..5 {
            let created = h
                .products
                .create(&h.ctx(), h.admin, sample_request(&format!("P{}", i), 3))
                .await
                .unwrap();
            assert!(seen.insert(created.id));

            let fetched = h.products.get(&h.ctx(), created.id).await.unwrap();
            assert_eq!(fetched, created);
            assert!(h.index.memory().get(&created.id.to_string()).await.unwrap().is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_to_different_products_all_commit() {
        let h = testing::harness().await;
        let mut ids = Vec::new();
        for i in 0..8 {
            let product = h
                .products
                .create(&h.ctx(), h.admin, sample_request(&format!("Shelf {}", i), 0))
                .await
                .unwrap();
            ids.push(product.id);
        }

        let mut tasks = Vec::new();
        for id in ids.clone() {
            let products = h.products.clone();
            tasks.push(tokio::spawn(async move {
                for round in 1..=20 {
                    let patch = UpdateProductRequest {
                        quantity: Some(round),
                        ..Default::default()
                    };
                    let ctx = OpContext::with_timeout(Duration::from_secs(30));
                    products.update(&ctx, id, patch).await?;
                }
                Ok::<_, CatalogError>(())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for id in ids {
            let stored = h.products.get(&h.ctx(), id).await.unwrap();
            assert_eq!(stored.quantity, 20);
        }
    }

    #[tokio::test]
    async fn invalid_create_touches_neither_store() {
        let h = testing::harness().await;
        let mut request = sample_request("", 1);
        request.price = Some(Decimal::from(-5));

        let err = h.products.create(&h.ctx(), h.admin, request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let (items, meta) = h.products.list(&h.ctx(), PageRequest::default()).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(meta.total_item, 0);
        assert_eq!(h.index.memory().len().await, 0);
    }

    #[tokio::test]
    async fn create_then_desync_keeps_the_committed_row() {
        let h = testing::harness().await;
        h.index.fail_next_upserts(1);
        let request = CreateProductRequest {
            name: "X".into(),
            brand: "B".into(),
            price: Some(Decimal::from(10)),
            ..Default::default()
        };

        let err = h.products.create(&h.ctx(), h.admin, request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexDesync);
        let product = match err {
            CatalogError::IndexDesync {
                operation, product, ..
            } => {
                assert_eq!(operation, Operation::Create);
                product
            }
            other => panic!("unexpected error {:?}", other),
        };

        let fetched = h.products.get(&h.ctx(), product.id).await.unwrap();
        assert_eq!(fetched.name, "X");
        assert_eq!(h.drain_repairs(), vec![product.id]);
    }

    #[tokio::test]
    async fn partial_update_keeps_omitted_fields() {
        let h = testing::harness().await;
        let created = h
            .products
            .create(&h.ctx(), h.admin, sample_request("Desk", 4))
            .await
            .unwrap();

        let patch = UpdateProductRequest {
            price: Some(Decimal::new(4999, 2)),
            color: Some(json!(["walnut"])),
            ..Default::default()
        };
        let updated = h.products.update(&h.ctx(), created.id, patch).await.unwrap();

        assert_eq!(updated.price, Decimal::new(4999, 2));
        assert_eq!(updated.color, json!(["walnut"]));
        assert_eq!(updated.name, created.name);
        assert_eq!(updated.brand, created.brand);
        assert_eq!(updated.quantity, created.quantity);
        assert_eq!(updated.specs, created.specs);
        assert_eq!(updated.created_at, created.created_at);

        let stored = h.products.get(&h.ctx(), created.id).await.unwrap();
        assert_eq!(stored, updated);
        let doc = h.index.memory().get(&created.id.to_string()).await.unwrap().unwrap();
        assert_eq!(doc.price, Decimal::new(4999, 2));
    }

    #[tokio::test]
    async fn update_of_missing_product_is_not_found_before_validation() {
        let h = testing::harness().await;
        let patch = UpdateProductRequest {
            name: Some(String::new()),
            ..Default::default()
        };
        let err = h
            .products
            .update(&h.ctx(), Uuid::new_v4(), patch)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_desync_reports_update_operation() {
        let h = testing::harness().await;
        let created = h
            .products
            .create(&h.ctx(), h.admin, sample_request("Shelf", 1))
            .await
            .unwrap();
        h.index.fail_next_upserts(1);

        let patch = UpdateProductRequest {
            name: Some("Tall Shelf".into()),
            ..Default::default()
        };
        let err = h.products.update(&h.ctx(), created.id, patch).await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::IndexDesync {
                operation: Operation::Update,
                ..
            }
        ));
        let stored = h.products.get(&h.ctx(), created.id).await.unwrap();
        assert_eq!(stored.name, "Tall Shelf");
        let doc = h.index.memory().get(&created.id.to_string()).await.unwrap().unwrap();
        assert_eq!(doc.name, "Shelf");
    }

    #[tokio::test]
    async fn delete_removes_row_and_document() {
        let h = testing::harness().await;
        let created = h
            .products
            .create(&h.ctx(), h.admin, sample_request("Bin", 1))
            .await
            .unwrap();

        h.products.delete(&h.ctx(), created.id).await.unwrap();
        let err = h.products.get(&h.ctx(), created.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(h.index.memory().get(&created.id.to_string()).await.unwrap().is_none());

        let err = h.products.delete(&h.ctx(), created.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_blocked_by_index_failure_keeps_the_row() {
        let h = testing::harness().await;
        let created = h
            .products
            .create(&h.ctx(), h.admin, sample_request("Sticky", 1))
            .await
            .unwrap();
        h.index.fail_deletes(true);

        let err = h.products.delete(&h.ctx(), created.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let still_there = h.products.get(&h.ctx(), created.id).await.unwrap();
        assert_eq!(still_there, created);
        assert!(h.index.memory().get(&created.id.to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelled_context_commits_nothing() {
        let h = testing::harness().await;
        let ctx = OpContext::background();
        ctx.cancel();

        let err = h
            .products
            .create(&ctx, h.admin, sample_request("Never", 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let (items, _) = h.products.list(&h.ctx(), PageRequest::default()).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(h.index.memory().len().await, 0);
    }

    #[tokio::test]
    async fn zero_page_and_limit_list_like_defaults() {
        let h = testing::harness().await;
        for i in 0..12 {
            h.products
                .create(&h.ctx(), h.admin, sample_request(&format!("Item {:02}", i), 1))
                .await
                .unwrap();
        }

        let (clamped, clamped_meta) = h
            .products
            .list(&h.ctx(), PageRequest::new(Some(0), Some(0)))
            .await
            .unwrap();
        let (defaults, default_meta) = h
            .products
            .list(&h.ctx(), PageRequest::new(Some(1), Some(10)))
            .await
            .unwrap();

        assert_eq!(clamped.len(), 10);
        assert_eq!(clamped, defaults);
        assert_eq!(clamped_meta, default_meta);
        assert_eq!(clamped_meta.total_item, 12);
        assert_eq!(clamped_meta.total_page, 2);
    }

    #[tokio::test]
    async fn search_reads_index_projections() {
        let h = testing::harness().await;
        for (name, price) in [("Red Chair", 30), ("Blue Chair", 20), ("Table", 90)] {
            let mut request = sample_request(name, 1);
            request.price = Some(Decimal::from(price));
            h.products.create(&h.ctx(), h.admin, request).await.unwrap();
        }

        let request = SearchRequest {
            name_text: Some("chiar".into()),
            ..Default::default()
        };
        let page = h.products.search(&h.ctx(), &request).await.unwrap();
        assert_eq!(page.total, 2);
        let names: Vec<_> = page.items.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Blue Chair", "Red Chair"]);
        assert_eq!((page.page, page.size), (1, 10));
    }

    #[tokio::test]
    async fn search_failure_is_a_transport_error() {
        let h = testing::harness().await;
        h.index.fail_searches(true);
        let err = h
            .products
            .search(&h.ctx(), &SearchRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn get_many_omits_unknown_ids() {
        let h = testing::harness().await;
        let a = h
            .products
            .create(&h.ctx(), h.admin, sample_request("A", 1))
            .await
            .unwrap();
        let found = h
            .products
            .get_many(&h.ctx(), &[a.id, Uuid::new_v4()])
            .await
            .unwrap();
        assert_eq!(found, vec![a]);
    }

    #[tokio::test]
    async fn non_positive_decrement_is_rejected() {
        let h = testing::harness().await;
        let a = h
            .products
            .create(&h.ctx(), h.admin, sample_request("A", 5))
            .await
            .unwrap();
        for amount in [0, -3] {
            let err = h
                .products
                .decrease_quantity(&h.ctx(), a.id, amount)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn concurrent_decrements_never_oversell() {
        let h = testing::harness().await;
        let product = h
            .products
            .create(&h.ctx(), h.admin, sample_request("Scarce", 10))
            .await
            .unwrap();

        let products = Arc::new(h.products.clone());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let products = products.clone();
            let id = product.id;
            tasks.push(tokio::spawn(async move {
                products
                    .decrease_quantity(&OpContext::background(), id, 3)
                    .await
            }));
        }

        let mut sold = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(remaining) => {
                    assert!(remaining >= 0);
                    sold += 3;
                }
                Err(err) => assert_eq!(err.kind(), ErrorKind::InsufficientQuantity),
            }
        }
        assert_eq!(sold, 9);

        let after = h.products.get(&h.ctx(), product.id).await.unwrap();
        assert_eq!(after.quantity, 1);
    }

    #[tokio::test]
    async fn batch_decrement_reports_partial_failure() {
        let h = testing::harness().await;
        let a = h
            .products
            .create(&h.ctx(), h.admin, sample_request("A", 10))
            .await
            .unwrap();
        let missing = Uuid::new_v4();

        let batch = h
            .products
            .decrease_quantity_batch(
                &h.ctx(),
                vec![
                    QuantityChange {
                        product_id: a.id.to_string(),
                        quantity: 5,
                    },
                    QuantityChange {
                        product_id: missing.to_string(),
                        quantity: 1,
                    },
                    QuantityChange {
                        product_id: "not-a-uuid".into(),
                        quantity: 1,
                    },
                ],
            )
            .await
            .unwrap();

        assert!(!batch.all_success);
        assert_eq!(batch.outcomes[0].result.as_ref().ok(), Some(&5));
        assert_eq!(
            batch.outcomes[1].result.as_ref().unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            batch.outcomes[2].result.as_ref().unwrap_err().kind(),
            ErrorKind::Validation
        );

        let after = h.products.get(&h.ctx(), a.id).await.unwrap();
        assert_eq!(after.quantity, 5);
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let h = testing::harness().await;
        let err = h
            .products
            .decrease_quantity_batch(&h.ctx(), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
