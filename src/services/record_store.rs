//! src/services/record_store.rs
//!
//! RecordStore: The relational system of record for products and their
//! images, backed by SQLite. Every read and write runs on a caller-supplied
//! connection (normally `&mut *tx` of a [`Tx`]) so one use-case call keeps all
//! of its relational work inside a single transaction. Dropping a [`Tx`]
//! without committing rolls it back.

use crate::{
    errors::{CatalogError, CatalogResult},
    models::product::{Product, ProductImage},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{
    FromRow, QueryBuilder, SqliteConnection, SqlitePool, Transaction,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    types::Json,
};
use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tracing::debug;
use uuid::Uuid;

pub type Tx = Transaction<'static, Sqlite>;

const PRODUCT_COLUMNS: &str = "id, name, description, category, brand, color, specs, price, \
                               quantity, created_by, created_at, updated_at";
const IMAGE_COLUMNS: &str = "id, product_id, image_object, position, created_at, updated_at";

#[derive(FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    description: String,
    category: Json<Value>,
    brand: String,
    color: Json<Value>,
    specs: Json<Value>,
    price: String,
    quantity: i64,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProductRow {
    fn into_product(self, images: Vec<ProductImage>) -> CatalogResult<Product> {
        let price = Decimal::from_str(&self.price).map_err(|err| CatalogError::Storage {
            context: "decoding product price",
            source: sqlx::Error::Decode(Box::new(err)),
        })?;
        Ok(Product {
            id: self.id,
            name: self.name,
            description: self.description,
            category: self.category.0,
            brand: self.brand,
            color: self.color.0,
            specs: self.specs.0,
            price,
            quantity: self.quantity,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            images,
        })
    }
}

#[derive(Clone)]
pub struct RecordStore {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
}

impl RecordStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open a pool on `url`, creating the database file if it is missing.
    pub async fn connect(url: &str, max_connections: u32) -> sqlx::Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&*self.db).await
    }

    /// Lightweight connectivity probe for readiness checks.
    pub async fn ping(&self) -> sqlx::Result<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(sqlx::Error::Protocol(format!("unexpected probe result {}", one)));
        }
        Ok(())
    }

    pub async fn begin(&self) -> CatalogResult<Tx> {
        self.db
            .begin()
            .await
            .map_err(CatalogError::storage("opening transaction"))
    }

    /// `BEGIN IMMEDIATE`: takes the write lock up front, so concurrent
    /// writers wait on the busy timeout instead of failing with SQLITE_BUSY
    /// when a read is upgraded to a write.
    pub async fn begin_write(&self) -> CatalogResult<Tx> {
        self.db
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(CatalogError::storage("opening write transaction"))
    }

    pub async fn commit(&self, tx: Tx) -> CatalogResult<()> {
        tx.commit()
            .await
            .map_err(CatalogError::storage("committing transaction"))
    }

    /// Fetch one product with its images. Returns NotFound if missing.
    pub async fn find_by_id(&self, conn: &mut SqliteConnection, id: Uuid) -> CatalogResult<Product> {
        let row: Option<ProductRow> =
            sqlx::query_as(&format!("SELECT {} FROM products WHERE id = ?", PRODUCT_COLUMNS))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(CatalogError::storage("finding product"))?;
        let row = row.ok_or_else(|| CatalogError::not_found("product", id))?;

        let mut images = self.images_for(conn, &[id]).await?;
        row.into_product(images.remove(&id).unwrap_or_default())
    }

    /// Fetch every product whose id is listed. Missing ids are omitted.
    pub async fn find_many(
        &self,
        conn: &mut SqliteConnection,
        ids: &[Uuid],
    ) -> CatalogResult<Vec<Product>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM products WHERE id IN (",
            PRODUCT_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY created_at ASC, id ASC");

        let rows: Vec<ProductRow> = builder
            .build_query_as()
            .fetch_all(&mut *conn)
            .await
            .map_err(CatalogError::storage("finding products by ids"))?;
        self.attach_images(conn, rows).await
    }

    /// One page of products plus the total row count. Images are preloaded.
    pub async fn list_page(
        &self,
        conn: &mut SqliteConnection,
        limit: i64,
        offset: i64,
    ) -> CatalogResult<(Vec<Product>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&mut *conn)
            .await
            .map_err(CatalogError::storage("counting products"))?;

        let rows: Vec<ProductRow> = sqlx::query_as(&format!(
            "SELECT {} FROM products ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
            PRODUCT_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(CatalogError::storage("listing products"))?;

        let products = self.attach_images(conn, rows).await?;
        Ok((products, total))
    }

    /// Return the subset of `ids` that still exist.
    pub async fn existing_ids(
        &self,
        conn: &mut SqliteConnection,
        ids: &[Uuid],
    ) -> CatalogResult<HashSet<Uuid>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT id FROM products WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let found: Vec<Uuid> = builder
            .build_query_scalar()
            .fetch_all(&mut *conn)
            .await
            .map_err(CatalogError::storage("checking product ids"))?;
        Ok(found.into_iter().collect())
    }

    pub async fn create(&self, conn: &mut SqliteConnection, product: &Product) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO products (
                id, name, description, category, brand, color, specs, price,
                quantity, created_by, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(Json(&product.category))
        .bind(&product.brand)
        .bind(Json(&product.color))
        .bind(Json(&product.specs))
        .bind(product.price.to_string())
        .bind(product.quantity)
        .bind(product.created_by)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(CatalogError::storage("creating product"))?;

        debug!(product_id = %product.id, "inserted product row");
        Ok(())
    }

    /// Overwrite every mutable column of an existing product.
    pub async fn save(&self, conn: &mut SqliteConnection, product: &Product) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE products SET
                name = ?, description = ?, category = ?, brand = ?, color = ?,
                specs = ?, price = ?, quantity = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&product.name)
        .bind(&product.description)
        .bind(Json(&product.category))
        .bind(&product.brand)
        .bind(Json(&product.color))
        .bind(Json(&product.specs))
        .bind(product.price.to_string())
        .bind(product.quantity)
        .bind(product.updated_at)
        .bind(product.id)
        .execute(&mut *conn)
        .await
        .map_err(CatalogError::storage("saving product"))?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::not_found("product", product.id));
        }
        Ok(())
    }

    /// Delete a product. Its image rows go with it through the cascade.
    pub async fn delete(&self, conn: &mut SqliteConnection, product: &Product) -> CatalogResult<()> {
        let result = sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(product.id)
            .execute(&mut *conn)
            .await
            .map_err(CatalogError::storage("deleting product"))?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::not_found("product", product.id));
        }
        debug!(product_id = %product.id, "deleted product row");
        Ok(())
    }

    pub async fn create_image(
        &self,
        conn: &mut SqliteConnection,
        image: &ProductImage,
    ) -> CatalogResult<()> {
        sqlx::query(&format!(
            "INSERT INTO product_images ({}) VALUES (?, ?, ?, ?, ?, ?)",
            IMAGE_COLUMNS
        ))
        .bind(image.id)
        .bind(image.product_id)
        .bind(&image.image_object)
        .bind(image.position)
        .bind(image.created_at)
        .bind(image.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(CatalogError::storage("creating product image"))?;
        Ok(())
    }

    pub async fn find_image(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> CatalogResult<ProductImage> {
        sqlx::query_as::<_, ProductImage>(&format!(
            "SELECT {} FROM product_images WHERE id = ?",
            IMAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(CatalogError::storage("finding product image"))?
        .ok_or_else(|| CatalogError::not_found("image", id))
    }

    pub async fn delete_image(
        &self,
        conn: &mut SqliteConnection,
        image: &ProductImage,
    ) -> CatalogResult<()> {
        let result = sqlx::query("DELETE FROM product_images WHERE id = ?")
            .bind(image.id)
            .execute(&mut *conn)
            .await
            .map_err(CatalogError::storage("deleting product image"))?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::not_found("image", image.id));
        }
        Ok(())
    }

    /// Atomically subtract `amount` from a product's quantity.
    ///
    /// The guard lives in the UPDATE itself, so concurrent callers can never
    /// drive the stored quantity below zero. Returns the new quantity.
    pub async fn decrement_quantity(&self, id: Uuid, amount: i64) -> CatalogResult<i64> {
        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE products SET quantity = quantity - ?, updated_at = ?
             WHERE id = ? AND quantity >= ?
             RETURNING quantity",
        )
        .bind(amount)
        .bind(Utc::now())
        .bind(id)
        .bind(amount)
        .fetch_optional(&*self.db)
        .await
        .map_err(CatalogError::storage("decreasing product quantity"))?;

        if let Some(quantity) = remaining {
            return Ok(quantity);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await
            .map_err(CatalogError::storage("checking product"))?;

        match exists {
            Some(_) => Err(CatalogError::InsufficientQuantity {
                product_id: id,
                requested: amount,
            }),
            None => Err(CatalogError::not_found("product", id)),
        }
    }

    async fn attach_images(
        &self,
        conn: &mut SqliteConnection,
        rows: Vec<ProductRow>,
    ) -> CatalogResult<Vec<Product>> {
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut images = self.images_for(conn, &ids).await?;
        rows.into_iter()
            .map(|row| {
                let own = images.remove(&row.id).unwrap_or_default();
                row.into_product(own)
            })
            .collect()
    }

    async fn images_for(
        &self,
        conn: &mut SqliteConnection,
        product_ids: &[Uuid],
    ) -> CatalogResult<HashMap<Uuid, Vec<ProductImage>>> {
        let mut grouped: HashMap<Uuid, Vec<ProductImage>> = HashMap::new();
        if product_ids.is_empty() {
            return Ok(grouped);
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM product_images WHERE product_id IN (",
            IMAGE_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for id in product_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY position ASC, created_at ASC, id ASC");

        let images: Vec<ProductImage> = builder
            .build_query_as()
            .fetch_all(&mut *conn)
            .await
            .map_err(CatalogError::storage("loading product images"))?;

        for image in images {
            grouped.entry(image.product_id).or_default().push(image);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::ErrorKind, services::testing};
    use serde_json::json;

    fn product(name: &str, quantity: i64) -> Product {
        let now = Utc::now();
        Product {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            category: json!(["laptop"]),
            brand: "Acme".into(),
            color: json!(["silver"]),
            specs: json!({"ram": "16GB"}),
            price: Decimal::new(99_950, 2),
            quantity,
            created_by: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            images: Vec::new(),
        }
    }

    fn image(product_id: Uuid, key: &str, position: i64) -> ProductImage {
        let now = Utc::now();
        ProductImage {
            id: Uuid::new_v4(),
            product_id,
            image_object: key.into(),
            position,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_then_find_round_trips_all_columns() {
        let db = testing::database().await;
        let store = db.records();
        let original = product("Laptop", 3);

        let mut tx = store.begin().await.unwrap();
        store.create(&mut tx, &original).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let found = store.find_by_id(&mut tx, original.id).await.unwrap();
        assert_eq!(found, original);
    }

    #[tokio::test]
    async fn uncommitted_writes_roll_back_on_drop() {
        let db = testing::database().await;
        let store = db.records();
        let original = product("Ghost", 1);

        {
            let mut tx = store.begin().await.unwrap();
            store.create(&mut tx, &original).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let err = store.find_by_id(&mut tx, original.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn duplicate_id_is_a_constraint_error() {
        let db = testing::database().await;
        let store = db.records();
        let original = product("Twin", 1);

        let mut tx = store.begin().await.unwrap();
        store.create(&mut tx, &original).await.unwrap();
        let err = store.create(&mut tx, &original).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
    }

    #[tokio::test]
    async fn list_page_preloads_images_and_counts_all_rows() {
        let db = testing::database().await;
        let store = db.records();
        let first = product("First", 1);
        let second = product("Second", 1);

        let mut tx = store.begin().await.unwrap();
        store.create(&mut tx, &first).await.unwrap();
        store.create(&mut tx, &second).await.unwrap();
        store
            .create_image(&mut tx, &image(first.id, "b.png", 1))
            .await
            .unwrap();
        store
            .create_image(&mut tx, &image(first.id, "a.png", 0))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let (items, total) = store.list_page(&mut tx, 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(items.len(), 2);

        let loaded = items.iter().find(|p| p.id == first.id).unwrap();
        let keys: Vec<_> = loaded.images.iter().map(|i| i.image_object.as_str()).collect();
        assert_eq!(keys, vec!["a.png", "b.png"]);

        let (page_two, total) = store.list_page(&mut tx, 1, 1).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page_two.len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_product_cascades_to_images() {
        let db = testing::database().await;
        let store = db.records();
        let doomed = product("Doomed", 1);
        let picture = image(doomed.id, "doomed.png", 0);

        let mut tx = store.begin().await.unwrap();
        store.create(&mut tx, &doomed).await.unwrap();
        store.create_image(&mut tx, &picture).await.unwrap();
        store.delete(&mut tx, &doomed).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = store.find_image(&mut tx, picture.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn image_for_unknown_product_violates_foreign_key() {
        let db = testing::database().await;
        let store = db.records();

        let mut tx = store.begin().await.unwrap();
        let err = store
            .create_image(&mut tx, &image(Uuid::new_v4(), "orphan.png", 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
    }

    #[tokio::test]
    async fn decrement_distinguishes_missing_from_insufficient() {
        let db = testing::database().await;
        let store = db.records();
        let stocked = product("Stocked", 5);

        let mut tx = store.begin().await.unwrap();
        store.create(&mut tx, &stocked).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(store.decrement_quantity(stocked.id, 2).await.unwrap(), 3);

        let err = store.decrement_quantity(stocked.id, 4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientQuantity);

        let err = store
            .decrement_quantity(Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(store.decrement_quantity(stocked.id, 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_many_skips_missing_ids() {
        let db = testing::database().await;
        let store = db.records();
        let kept = product("Kept", 1);

        let mut tx = store.begin().await.unwrap();
        store.create(&mut tx, &kept).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let found = store
            .find_many(&mut tx, &[kept.id, Uuid::new_v4()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, kept.id);

        let existing = store
            .existing_ids(&mut tx, &[kept.id, Uuid::new_v4()])
            .await
            .unwrap();
        assert!(existing.contains(&kept.id));
        assert_eq!(existing.len(), 1);
    }
}
