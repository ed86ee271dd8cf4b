//! corral: a distributed, at-least-once object pool backed by Redis.
//!
//! Producers queue opaque string objects into named pools; consumers
//! claim them under leased sessions and either release (remove), requeue
//! (hand back, possibly delayed) or extend them. A janitor returns the
//! objects of crashed consumers to the queue once their leases expire.
//!
//! All pool state lives in the store and is mutated exclusively through
//! atomic Lua scripts (`scripts`); everything else is per-process
//! machinery: the script façade (`client`), the claim lifecycle
//! (`claim`), high-level pool operations (`pool`), the claim dispatch
//! engine (`dispatch`), the registry and janitor (`registry`) and the
//! processor host (`bootstrap`).

pub mod bootstrap;
pub mod claim;
pub mod client;
pub mod dispatch;
pub mod keys;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod scripts;
pub mod settings;
pub mod trace;

pub use corral_macros::test;
