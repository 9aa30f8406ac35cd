//! Thumbnail generation capability.
//!
//! Treated as an opaque function producing an optional derived blob: it may
//! decline (unsupported type, resource pressure) by returning `None`, and the
//! upload proceeds without a thumbnail. Codec handling lives behind this
//! trait, outside this crate's scope.

use bytes::Bytes;

pub trait ThumbnailGenerator: Send + Sync + std::fmt::Debug + 'static {
    /// Derives a thumbnail from the payload, or `None` when the content type
    /// is unsupported or generation fails.
    fn generate(&self, data: &[u8], filename: &str) -> Option<Bytes>;
}

/// Default generator: never produces thumbnails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThumbnails;

impl ThumbnailGenerator for NoThumbnails {
    fn generate(&self, _data: &[u8], _filename: &str) -> Option<Bytes> {
        None
    }
}
