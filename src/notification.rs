pub(crate) mod notifier;

use std::sync::Arc;

/// A removal listener, called with the key of a removed entry and the
/// [`RemovalCause`][removal-cause] of its removal.
///
/// The listener is invoked after the entry has been unlinked from the cache,
/// on the thread that performed the operation that discovered the removal. It
/// is not handed the value; by the time a `Reclaimed` notification is
/// delivered the value no longer exists.
///
/// [removal-cause]: ./enum.RemovalCause.html
pub type RemovalListener<K> = Arc<dyn Fn(Arc<K>, RemovalCause) + Send + Sync + 'static>;

// NOTE: Dropping the cache will drop all entries without sending
// notifications. Call `invalidate_all` first when the listener must observe
// every entry.

/// Indicates the reason why a cached entry was removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalCause {
    /// The entry's expiration timestamp has passed.
    Expired,
    /// The entry was manually removed by the user.
    Explicit,
    /// The entry itself was not actually removed, but its value was replaced
    /// by the user.
    Replaced,
    /// The entry's value slot was cleared after its last strong reference went
    /// away.
    Reclaimed,
}

impl RemovalCause {
    /// Returns `true` if the entry was removed by the cache itself rather than
    /// by a user action.
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Expired | Self::Reclaimed)
    }
}
