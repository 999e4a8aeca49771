use std::{
    any::{Any, TypeId},
    hash::{BuildHasher, Hash},
    sync::Arc,
};

use parking_lot::RwLock;
use triomphe::Arc as TrioArc;

use crate::{table::ShardedMap, value::CacheValue};

const WAITER_MAP_NUM_SHARDS: usize = 16;

type ErrorObject = Arc<dyn Any + Send + Sync + 'static>;

/// Private waiter-namespace marker for the infallible `init_or_read` family,
/// so its flights can never collide with a `try_init_or_read::<(), _>` call.
struct NeverErr;

/// `Ok(None)` means the loader ran and declined to cache a value.
type WaiterValue<K, V> = Option<Result<Option<CacheValue<K, V>>, ErrorObject>>;
type Waiter<K, V> = TrioArc<RwLock<WaiterValue<K, V>>>;

pub(crate) enum InitResult<K, V, E> {
    /// This call's loader ran (`None` = it declined to cache anything).
    Initialized(Option<CacheValue<K, V>>),
    /// Another thread's flight, or an entry that appeared in the meantime,
    /// already produced the outcome.
    ReadExisting(Option<CacheValue<K, V>>),
    InitErr(Arc<E>),
}

/// Single-flight coordinator for the `get_with` family.
///
/// A loader call for a missing key first installs a write-locked waiter keyed
/// by `(key, error type)`; every concurrent caller for the same key finds that
/// waiter and blocks on its read lock instead of running the loader again.
/// The waiter map is separate from the cache's table and its lock is per-key,
/// so a slow loader only ever blocks callers racing for the same key.
pub(crate) struct ValueInitializer<K, V, S> {
    // TypeId is the type ID of the concrete error type of generic type E in
    // the try_init_or_read method. We use the type ID as a part of the key to
    // ensure that we can always downcast the trait object ErrorObject (in
    // Waiter) into its concrete type.
    waiters: ShardedMap<(Arc<K>, TypeId), Waiter<K, V>, S>,
}

impl<K, V, S> ValueInitializer<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub(crate) fn with_hasher(hasher: S) -> Self {
        Self {
            waiters: ShardedMap::with_num_shards_and_hasher(WAITER_MAP_NUM_SHARDS, None, hasher),
        }
    }

    /// # Panics
    /// Panics if the `init` closure has been panicked.
    pub(crate) fn init_or_read(
        &self,
        key: Arc<K>,
        // Closure to get an existing value from the cache.
        get: impl FnMut() -> Option<CacheValue<K, V>>,
        init: impl FnOnce() -> Option<V>,
        // Closure to insert a freshly loaded value into the cache.
        mut insert: impl FnMut(V) -> CacheValue<K, V>,
    ) -> InitResult<K, V, ()> {
        let type_id = TypeId::of::<NeverErr>();
        let pre_init = make_pre_init(get);

        let post_init = |loaded: Option<V>| {
            let value = loaded.map(&mut insert);
            (Some(Ok(value.clone())), InitResult::Initialized(value))
        };

        self.do_try_init(&key, type_id, pre_init, init, post_init)
    }

    /// # Panics
    /// Panics if the `init` closure has been panicked.
    pub(crate) fn try_init_or_read<E>(
        &self,
        key: Arc<K>,
        get: impl FnMut() -> Option<CacheValue<K, V>>,
        init: impl FnOnce() -> Result<Option<V>, E>,
        mut insert: impl FnMut(V) -> CacheValue<K, V>,
    ) -> InitResult<K, V, E>
    where
        E: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<E>();
        let pre_init = make_pre_init(get);

        let post_init = |loaded: Result<Option<V>, E>| match loaded {
            Ok(v) => {
                let value = v.map(&mut insert);
                (Some(Ok(value.clone())), InitResult::Initialized(value))
            }
            Err(e) => {
                let err: ErrorObject = Arc::new(e);
                (
                    Some(Err(Arc::clone(&err))),
                    InitResult::InitErr(err.downcast().expect("Bug: wrong error type")),
                )
            }
        };

        self.do_try_init(&key, type_id, pre_init, init, post_init)
    }

    /// # Panics
    /// Panics if the `init` closure has been panicked.
    fn do_try_init<O, E>(
        &self,
        key: &Arc<K>,
        type_id: TypeId,
        mut pre_init: impl FnMut() -> Option<(WaiterValue<K, V>, InitResult<K, V, E>)>,
        init: impl FnOnce() -> O,
        mut post_init: impl FnMut(O) -> (WaiterValue<K, V>, InitResult<K, V, E>),
    ) -> InitResult<K, V, E>
    where
        E: Send + Sync + 'static,
    {
        use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
        use InitResult::*;

        const MAX_RETRIES: usize = 200;
        let mut retries = 0;

        let waiter_key = Arc::new((Arc::clone(key), type_id));

        loop {
            let waiter = TrioArc::new(RwLock::new(None));
            let mut lock = waiter.write();

            match self
                .waiters
                .try_insert(Arc::clone(&waiter_key), TrioArc::clone(&waiter))
            {
                None => {
                    // Our waiter was inserted.
                    // Check if the value has already been inserted by another
                    // thread.
                    if let Some((waiter_val, init_res)) = pre_init() {
                        // Yes. Set the waiter value, remove our waiter, and
                        // return the existing value.
                        *lock = waiter_val;
                        self.waiters.remove(&waiter_key);
                        return init_res;
                    }

                    // The value still does not exist. Let's evaluate the init
                    // closure. Catching panic is safe here as we do not try to
                    // evaluate the closure again.
                    match catch_unwind(AssertUnwindSafe(init)) {
                        // Evaluated.
                        Ok(value) => {
                            let (waiter_val, init_res) = post_init(value);
                            *lock = waiter_val;
                            self.waiters.remove(&waiter_key);
                            return init_res;
                        }
                        // Panicked.
                        Err(payload) => {
                            *lock = None;
                            // Remove the waiter so that others can retry.
                            self.waiters.remove(&waiter_key);
                            resume_unwind(payload);
                        }
                    } // The write lock will be unlocked here.
                }
                Some(res) => {
                    // Somebody else's waiter already exists. Drop our write
                    // lock and wait for the read lock to become available.
                    std::mem::drop(lock);
                    match &*res.read() {
                        Some(Ok(value)) => return ReadExisting(value.clone()),
                        Some(Err(e)) => {
                            return InitErr(
                                Arc::clone(e).downcast().expect("Bug: wrong error type"),
                            )
                        }
                        // None means somebody else's init closure has been
                        // panicked.
                        None => {
                            retries += 1;
                            if retries < MAX_RETRIES {
                                // Retry from the beginning.
                                continue;
                            } else {
                                panic!(
                                    "Too many retries. Tried to read the return value from the \
                                    `init` closure but failed {retries} times. Maybe the `init` \
                                    kept panicking?"
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}

#[inline]
fn make_pre_init<K, V, E>(
    mut get: impl FnMut() -> Option<CacheValue<K, V>>,
) -> impl FnMut() -> Option<(WaiterValue<K, V>, InitResult<K, V, E>)> {
    move || {
        get().map(|value| {
            (
                Some(Ok(Some(value.clone()))),
                InitResult::ReadExisting(Some(value)),
            )
        })
    }
}
