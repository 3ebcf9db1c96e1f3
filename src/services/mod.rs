//! Domain services and the collaborators they orchestrate.

pub mod context;
pub mod elasticsearch_index;
pub mod image_service;
pub mod index_gateway;
pub mod memory_index;
pub mod object_store;
pub mod product_service;
pub mod query_compiler;
pub mod reconciler;
pub mod record_store;

#[cfg(test)]
pub mod testing;
