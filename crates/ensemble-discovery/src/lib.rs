//! Capability discovery for Ensemble.
//!
//! Sources group one or more origins (directories on disk, plugin roots, a
//! capability registry over HTTP, in-process registrations) that report
//! agents, skills, commands or services. The [`DiscoveryCache`] serves their
//! last good snapshot and refreshes it on a timer.
//!
//! # Main types
//!
//! - [`DiscoveryCache`] — TTL cache over every registered source.
//! - [`DiscoverySource`] — A kind, a refresh interval, and its origins.
//! - [`DiscoveryOrigin`] — Trait implemented by [`DirectoryOrigin`], [`HttpOrigin`] and [`RuntimeOrigin`].
//! - [`CapabilityItem`] — One discovered capability.

/// Source registry, snapshots and refresh timers.
pub mod cache;
/// Where capability data comes from.
pub mod origin;
/// Capability kinds and items.
pub mod types;

pub use cache::{
    DiscoveryCache, DiscoverySource, DiscoveryStatus, SourceConfig, SourceState, SourceStatus,
    DEFAULT_ORIGIN_TIMEOUT, TTL_FRACTION,
};
pub use origin::{DirectoryOrigin, DiscoveryOrigin, HttpOrigin, RuntimeOrigin, HTTP_TIMEOUT};
pub use types::{dedupe_by_name, CapabilityItem, CapabilityKind};
