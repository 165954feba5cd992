#![forbid(unsafe_code)]

//! # requery
//!
//! An asynchronous-data cache and query-coordination engine: deduplicating
//! in-flight requests, storing results with staleness/retention policy,
//! driving reactive observers, and orchestrating retries, invalidation, and
//! optimistic mutations — framework-agnostic and independent of any
//! particular transport or UI layer.
//!
//! The engine is built around five cooperating pieces:
//!
//! - [`key`] — deterministic structural hashing of a query identifier.
//! - [`signal`] — minimal reactive cells with microtask-batched notification.
//! - [`storage`] — the hashed-key cache map: LRU, tag index, prefix trie, GC.
//! - [`executor`] — per-key deduplicated fetch execution with retry/backoff.
//! - [`client`] — the facade tying the above together: fetch/set/invalidate.
//!
//! [`observer`] and [`infinite`] bind a caller's declarative query options to
//! a shared cache entry and derive a memoized result view; [`mutation`]
//! tracks per-execution mutation state with optimistic apply/rollback.
//!
//! A [`client::QueryClient`] is built on `Rc`/`RefCell` and is meant to live
//! on a single `tokio::task::LocalSet` (see §5 of the design notes in
//! `DESIGN.md`) — it is not `Send`, matching the single-threaded cooperative
//! scheduling model the cache's invariants are written against.

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod focus;
pub mod infinite;
pub mod instant;
pub mod key;
pub mod mutation;
pub mod observer;
pub mod persist;
pub mod plugin;
pub mod schema;
pub mod signal;
pub mod storage;

pub use client::QueryClient;
pub use config::ClientConfig;
pub use error::{QueryError, QueryErrorKind};
pub use key::QueryKey;
pub use mutation::{MutationObserver, MutationObserverOptions, MutationState, MutationStatus};
pub use observer::{QueryObserver, QueryObserverOptions, QueryResult};
pub use storage::entry::{CacheEntry, FetchDirection, Status};
