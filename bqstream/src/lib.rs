//! `BqStream` - per-attribute change capture with batched warehouse delivery
//!
//! The host persistence layer reports committed mutations; this library
//! turns them into per-attribute change records, queues them durably, and
//! drains the queue to an analytical warehouse in bounded batches on a
//! scheduled tick. Tables enrolled late catch up through cursor-driven
//! backfill, and a standalone archiver bulk-loads history in
//! warehouse-sized windows.
//!
//! Storage and transport are ports: the durable queue, backfill cursors,
//! host-table reads, and the warehouse itself are traits the host wires up
//! at startup. The `bqstream-memory` crate implements all of them in
//! memory for tests and development.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod audit;
pub mod backfill;
pub mod capture;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod errors;
pub mod queue;
pub mod registry;
pub mod source;
pub mod types;
pub mod warehouse;
