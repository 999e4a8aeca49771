/// The error type for the [`Cache#set_expiration`][set-expiration] method.
///
/// [set-expiration]: ../struct.Cache.html#method.set_expiration
#[derive(thiserror::Error, Debug)]
pub enum ExpirationError {
    /// The given per-entry expiration carries neither a time-to-live nor a
    /// time-to-idle, and the cache was built without default expirations, so
    /// the call could never have an effect.
    ///
    /// Set at least one axis on the [`EntryExpiration`][entry-expiration], or
    /// configure a default `time_to_live`/`time_to_idle` on the
    /// [`CacheBuilder`][cache-builder] at the cache creation time.
    ///
    /// [entry-expiration]: ../struct.EntryExpiration.html
    /// [cache-builder]: ../struct.CacheBuilder.html
    #[error(
        "Neither time_to_live nor time_to_idle was given, and this cache has \
    no default expirations. Set at least one axis on the EntryExpiration, or \
    configure a default on the CacheBuilder at the cache creation time"
    )]
    NoExpiration,
}
