//! A multi-process page-level lock manager for a shared, single-writer
//! storage engine.
//!
//! Several independent processes, each embedding its own copy of a Pager
//! (B-tree, journal, VFS — all external collaborators this crate doesn't
//! know about), can safely interleave access to one database file by
//! mapping a small auxiliary coordination file — the *heap-mapped area*
//! (HMA) — and mutating it with atomic compare-and-swap operations backed
//! by advisory OS byte-range locks for crash detection.
//!
//! Entry point: an embedder owns one [`Registry`] (typically behind an
//! `Arc`) and calls [`Registry::connect`] once per Pager instance to get a
//! [`Client`], then drives it through `begin` / `lock` / `end` /
//! `has_lock` for each transaction.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod hma;
pub mod logger;
pub mod pager;
pub mod registry;
mod time;

pub use client::{Client, ClientId, WriteStats};
pub use config::HmaConfig;
pub use error::LockError;
pub use logger::{DefaultLogger, Logger};
pub use pager::Pager;
pub use registry::Registry;
