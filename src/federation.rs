//! Federated Listing
//!
//! Lists child resources (schemas, extensions) across every database of a server
//! and aggregates them into one globally paginated [`List`].
//!
//! Each partition is queried through its own connection, one after another, in
//! enumerator order. Items keep the order their partition returned them in.
//!
//! # Consistency
//! There is no snapshot spanning partitions. An object created or dropped in one
//! database while another is being listed may or may not appear in the result,
//! and `count` reflects what each partition reported at the moment it was visited.

use tracing::debug;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::resource::List;

/// Collects the items whose global rank falls in `[offset, offset + limit)`
#[derive(Debug)]
pub struct PageWindow<T> {
    offset: u64,
    limit: u64,
    seen: u64,
    items: Vec<T>,
}

impl<T> PageWindow<T> {
    #[must_use]
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit, seen: 0, items: Vec::new() }
    }

    /// Offer the next item in global order
    pub fn offer(&mut self, item: T) {
        if self.seen >= self.offset && (self.items.len() as u64) < self.limit {
            self.items.push(item);
        }
        self.seen += 1;
    }

    /// Number of items offered so far
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// True once the page is full; later items only count
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() as u64 >= self.limit
    }

    fn pending_skip(&self) -> u64 {
        self.offset.saturating_sub(self.seen)
    }

    fn room(&self) -> u64 {
        self.limit.saturating_sub(self.items.len() as u64)
    }

    /// Local `(offset, limit)` to fetch from a partition holding `matched`
    /// items, or `None` when none of them falls inside the page
    #[must_use]
    pub fn slice(&self, matched: u64) -> Option<(u64, u64)> {
        let skip = self.pending_skip().min(matched);
        let take = self.room().min(matched - skip);
        (take > 0).then_some((skip, take))
    }

    /// Account for a whole partition of `matched` items of which only the
    /// `items` starting at local rank `skip` were fetched
    pub fn absorb<I: IntoIterator<Item = T>>(&mut self, matched: u64, skip: u64, items: I) {
        self.seen += skip;
        let mut fetched = 0;
        for item in items {
            self.offer(item);
            fetched += 1;
        }
        self.seen += matched.saturating_sub(skip + fetched);
    }

    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Source of partitions and their children
#[async_trait]
pub trait PartitionLister: Send + Sync {
    type Item: Send;

    /// All partitions, in a stable order
    async fn partitions(&self, ctx: &Context) -> Result<Vec<String>>;

    /// Offer every matching child of `partition` to `window` and return how many matched
    async fn list_partition(
        &self,
        ctx: &Context,
        partition: &str,
        window: &mut PageWindow<Self::Item>,
    ) -> Result<u64>;
}

/// List across partitions, optionally restricted to one partition by name.
///
/// A filter naming a partition that does not exist yields an empty list.
/// The first partition error aborts the whole call.
pub async fn list_federated<L>(
    ctx: &Context,
    lister: &L,
    partition_filter: Option<&str>,
    offset: u64,
    limit: u64,
) -> Result<List<L::Item>>
where
    L: PartitionLister + ?Sized,
{
    let mut window = PageWindow::new(offset, limit);
    let mut count = 0;

    for partition in lister.partitions(ctx).await? {
        if partition_filter.is_some_and(|wanted| wanted != partition) {
            continue;
        }
        ctx.check()?;

        let matched = lister.list_partition(ctx, &partition, &mut window).await?;
        debug!(partition = %partition, matched, "partition listed");
        count += matched;
    }

    Ok(List { count, body: window.into_items() })
}
