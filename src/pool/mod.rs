//! Connection pool executor.
//!
//! The pool decides *how* a network call executes: which connection slot it
//! uses, how long it may take and how often it is retried.  It never buffers
//! excess work; requests beyond the global ceiling fail fast.

pub mod executor;
pub mod request;

pub use executor::{ConnectionPool, ConnectionSlot, HostStats, PoolStats, StreamLease};
pub use request::{FormPart, RequestBody, RequestSpec, ResponseBody, ResponseKind};
