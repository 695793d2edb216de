use async_trait::async_trait;

use crate::context::Context;

/// Ordered events handled together.
pub type Batch<E> = Vec<E>;

/// Receives every decoded batch from a consumer.
///
/// Returning an error leaves the batch uncommitted, so the same records come
/// back on a later poll. Processing must therefore tolerate duplicates.
#[async_trait]
pub trait BatchProcessor<E: Send>: Send + Sync {
    async fn process_batch(&self, ctx: &Context, batch: &mut Batch<E>) -> anyhow::Result<()>;
}
