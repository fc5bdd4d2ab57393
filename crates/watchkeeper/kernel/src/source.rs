//! Snapshot source seam.

use async_trait::async_trait;
use watchkeeper_types::Snapshot;

use crate::error::FetchError;

/// An external data source polled by the change detector.
///
/// The kernel treats the returned payload as opaque apart from
/// fingerprinting and row-level comparison.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self) -> Result<Snapshot, FetchError>;
}
