pub mod api;
pub mod auth;
pub mod blobstore;
pub mod cas;
pub mod catalog;
pub mod inspect;
pub mod metastore;
pub mod metrics;
pub mod thumbnail;
