//! # SPMC overwrite ring over shared memory
//!
//! A wait-free **single-producer / multi-consumer** ring buffer for
//! inter-process streaming of fixed-size records, built for latency-critical
//! feeds (market-data snapshots and the like) where the producer must never
//! be regulated by consumer progress.
//!
//! The producer overwrites the ring in place; a consumer that falls behind
//! is **lapped**, told so, and resynchronizes itself. There is no
//! back-pressure, no acknowledgement, and no recovery of records missed
//! during a lap.
//!
//! # Features
//!
//! * **Lock-free, wait-free producer** — `push` never blocks and never fails
//! * **Version-stamped slots** for publication, lapping and tearing detection
//! * **Consumer catch-up** that resynchronizes after arbitrarily many laps
//! * **Cache-line isolated** hot fields (no false sharing)
//! * **Shared-memory bootstrap** via a tiny named discovery region;
//!   buffer mappings prefer huge pages when the kernel grants them
//! * **Heap backing** ([`local_ring`]) with identical semantics for
//!   in-process use and testing
//! * Zero allocations after initialization
//!
//! # Protocol
//!
//! Each slot carries a version on its own cache line:
//!
//! * version `0` — never written
//! * version `v > 0` — holds the block of wrap generation `v`; overwriting
//!   a slot raises its version by exactly one
//!
//! The producer writes payload, then version (release), then the
//! `last_block_id` info cell (release). A consumer acquires the version,
//! copies the payload, and on the next read proves that the previously
//! delivered slot still carries the version it had — the only window where a
//! torn copy can slip through is flagged as
//! [`ReadStatus::LappedPrecaution`].
//!
//! Consumers never block: [`Consumer::pop`] reports one of four statuses
//! ([`ReadStatus`]) and callers that want to wait for arrival poll
//! externally.
//!
//! # Quick example
//!
//! ```ignore
//! // producer process
//! let tx = ringcast::create_producer::<[u64; 128]>("md")?;
//! tx.push(&snapshot);
//!
//! // consumer process
//! let mut rx = ringcast::open_consumer::<[u64; 128]>("md")?;
//! let mut snapshot = [0u64; 128];
//! loop {
//!     match rx.pop(&mut snapshot) {
//!         ringcast::ReadStatus::New => handle(&snapshot),
//!         ringcast::ReadStatus::NoNew => std::hint::spin_loop(),
//!         // lapped either way; the cursor already resynchronized
//!         _ => {}
//!     }
//! }
//! ```
//!
//! Payload types must be `Copy` plain-old-data: they are copied byte-wise
//! through shared memory, so pointers, references and anything with drop
//! glue are out.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

mod channel;
mod error;
pub mod layout;
mod ring;
mod shm;
pub mod stats;

pub use channel::{create_producer, open_consumer, ShmRing};
pub use error::{Result, RingError};
pub use layout::{Slot, RING_CAPACITY};
pub use ring::{local_ring, Consumer, HeapRing, Producer, ReadStatus, RingMem};
