//! OData catalog client for the Copernicus Data Space Ecosystem.
//!
//! Builds one filtered, paginated query combining spatial, name, and date
//! predicates, and accumulates every result page into a flat candidate list
//! before any download starts.

pub mod client;
pub mod error;

pub use client::{CatalogClient, Product, ProductFilter};
pub use error::ApiError;
