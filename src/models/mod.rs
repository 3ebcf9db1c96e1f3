//! Core data models for the catalog service.
//!
//! `product` holds the relational entities, `search` the index projection.
//! The two are kept as separate types joined by a pure mapping.

pub mod image;
pub mod page;
pub mod product;
pub mod response;
pub mod search;
pub mod validation;
