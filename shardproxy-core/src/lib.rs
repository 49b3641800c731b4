//! `shardproxy-core`: the connection-oriented, event-driven request/response
//! pipeline at the center of this proxy — non-blocking socket I/O, the RESP
//! parser, per-connection queues, multi-key fragmentation/coalescing,
//! consistent-hash backend selection, and the sentinel-driven master switch.
//!
//! Everything in this crate runs on a single thread (the event loop); the
//! only cross-thread traffic is the read-only snapshots in [`hotset`] and the
//! atomics in [`stats`] and [`quota`], both published for a separate stats
//! sampler / config poller thread to read without locking.

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod event_loop;
pub mod fragment;
pub mod hash;
pub mod hotset;
pub mod message;
pub mod parser;
pub mod pool;
pub mod protocol;
pub mod quota;
pub mod sentinel;
pub mod stats;
pub mod timeout_wheel;

pub use error::{CoreError, CoreResult};
