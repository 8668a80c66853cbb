use async_trait::async_trait;
use qw_quota::Snapshot;

/// Anything that can produce a provider's current quota snapshot.
///
/// How the source authenticates or decodes its wire format is its own
/// business; the poll loop only sees the resulting [`Snapshot`].
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn provider(&self) -> &str;

    async fn fetch(&self) -> anyhow::Result<Snapshot>;
}
