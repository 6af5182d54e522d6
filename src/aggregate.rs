//! Aggregate abstraction shared by every cache tier

use uuid::Uuid;

/// An event-sourced entity whose current state the cache mirrors.
///
/// One cache instance manages exactly one aggregate kind, bound through this
/// type parameter. The tiers only ever hold copies; the event store owns the
/// authoritative history.
///
/// # Implementation Requirements
///
/// - `kind()` must return the same value for every instance of the type
/// - `id()` must be stable for the lifetime of the aggregate
/// - `version()` is the number of applied events; the cache never alters it
pub trait Aggregate: Clone + Send + Sync + 'static {
    /// Name of the aggregate kind, used for Redis keys and log fields.
    fn kind() -> &'static str;

    /// Globally unique identity of this aggregate.
    fn id(&self) -> Uuid;

    /// Current version (count of applied events).
    fn version(&self) -> u64;
}
