//! Defines routes for the catalog HTTP API, the internal RPC surface and
//! presigned object downloads.
//!
//! ## Structure
//! - **Products**
//!   - `GET    /api/products`               - paged list
//!   - `GET    /api/products/search`        - paged, filtered index search
//!   - `GET    /api/products/{id}`          - fetch one
//!   - `POST   /api/products`               - create (admin)
//!   - `PUT    /api/products/{id}`          - partial update (admin)
//!   - `DELETE /api/products/{id}`          - delete with images (admin)
//!
//! - **Images**
//!   - `POST   /api/products/{id}/images`        - attach uploaded objects (admin)
//!   - `POST   /api/products/{id}/images/upload` - multipart upload (admin)
//!   - `GET    /api/images/{id}/url`             - presigned download URL
//!   - `GET    /api/images/{id}`                 - stream bytes
//!   - `DELETE /api/images/{id}`                 - delete (admin)
//!
//! - **Objects**: `GET /objects/{bucket}/{*key}?expires=&signature=`
//! - **RPC**: `POST /rpc/product.ProductService/<Method>`
//! - **Admin**: `POST /api/admin/reindex`

use crate::{
    handlers::{
        admin_handlers::reindex,
        health_handlers::{healthz, readyz},
        image_handlers::{attach_images, delete_image, image_url, stream_image, upload_images},
        object_handlers::get_presigned_object,
        product_handlers::{
            create_product, delete_product, get_product, list_products, search_products,
            update_product,
        },
        rpc_handlers::{
            decrease_quantity, decrease_quantity_by_ids, get_product_by_id, get_product_by_ids,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Largest multipart body accepted by the upload endpoint.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Build and return the router for every endpoint. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Product routes
        .route("/api/products", get(list_products).post(create_product))
        .route("/api/products/search", get(search_products))
        .route(
            "/api/products/{id}",
            get(get_product).put(update_product).delete(delete_product),
        )
        // Image routes
        .route("/api/products/{id}/images", post(attach_images))
        .route(
            "/api/products/{id}/images/upload",
            post(upload_images).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/images/{id}/url", get(image_url))
        .route("/api/images/{id}", get(stream_image).delete(delete_image))
        // Presigned downloads
        .route("/objects/{bucket}/{*key}", get(get_presigned_object))
        // Admin
        .route("/api/admin/reindex", post(reindex))
        .nest("/rpc/product.ProductService", rpc_routes())
}

fn rpc_routes() -> Router<AppState> {
    Router::new()
        .route("/GetProductById", post(get_product_by_id))
        .route("/GetProductByIds", post(get_product_by_ids))
        .route("/DecreaseQuantity", post(decrease_quantity))
        .route("/DecreaseQuantityByIds", post(decrease_quantity_by_ids))
}
