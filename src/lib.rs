//! Game feed recorder and reconciliation library.
//!
//! This crate provides the core types and logic used by the `game_feed`
//! recorder binary and the `player` tool:
//!
//! - `envelope`: event envelopes, the closed `EventKind` classification and
//!   bus selectors
//! - `bus`: in-process publish/subscribe with a bounded queue, one dispatch
//!   thread and weak subscriber references
//! - `store`: single-writer, partitioned, size/time-flushed event store with
//!   gapless per-session sequence numbers
//! - `record`: durable on-disk schema (column batches in CRC-checked frames)
//! - `reconciler`: authoritative/optimistic state merge behind an atomically
//!   swapped snapshot
//! - `capture`: JSON-lines adapter feeding the bus
//! - `pipeline`: explicit assembly and ordered shutdown of the above
//!
//! The binaries in this repository (`src/main.rs` and `src/bin/player.rs`)
//! use these modules to record a live feed and to read sessions back.
pub mod bus;
pub mod capture;
pub mod envelope;
pub mod pipeline;
pub mod reconciler;
pub mod record;
pub mod store;
