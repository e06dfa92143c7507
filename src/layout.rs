//! In-shared-memory data layout.
//!
//! Everything in this module is mapped into more than one process, so the
//! layout is a wire contract: `#[repr(C)]` throughout, every field that a
//! remote side reads sits at a fixed offset, and hot fields are isolated on
//! their own 64-byte cache lines. Producer and consumer binaries must be
//! compiled against the same payload type `T`; the region sizes derived from
//! `T` are validated when a consumer attaches.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, RingError};

/// Number of slots in every ring. Fixed, and a power of two so that block
/// ids map to slot indices by masking.
pub const RING_CAPACITY: usize = 4096;

/// Mask mapping a block id to its slot index.
pub const INDEX_MASK: u64 = RING_CAPACITY as u64 - 1;

/// `log2(RING_CAPACITY)`, used to derive a block's wrap generation.
pub const CAPACITY_LOG2: u32 = RING_CAPACITY.trailing_zeros();

/// Capacity of each identifier field in the discovery record, including the
/// NUL terminator.
pub const PATH_CAPACITY: usize = 128;

/// Wrap generation of block `id`: the version its slot carries once written.
///
/// Ids start at 1; id 0 and version 0 both mean "never written". Blocks
/// `1..RING_CAPACITY - 1` belong to generation 1, and the generation rises
/// by one each time the id crosses a multiple of the capacity.
#[inline(always)]
pub const fn generation(id: u64) -> u64 {
    (id >> CAPACITY_LOG2) + 1
}

/// Aligns (and therefore pads) a value to a 64-byte cache line.
///
/// The slot and info layouts promise 64-byte granularity to the remote side,
/// which is why this exists instead of `crossbeam_utils::CachePadded` (128
/// bytes on x86_64). `CachePadded` is still used for process-local state
/// with no wire contract.
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct CacheAligned<T>(pub(crate) T);

/// One ring cell: a version stamp on its own cache line, then the payload.
///
/// ```text
/// offset 0   version  u64, little-endian, padded to 64 bytes
/// offset 64  payload  T, padded to a multiple of 64 bytes
/// ```
///
/// The version doubles as publication flag and tearing detector: 0 means the
/// slot was never written, and each overwrite of the slot raises it by
/// exactly one. The producer stores the payload first and the version
/// second (release), so a reader that observes a version is guaranteed to
/// observe the matching payload.
#[derive(Debug, Default)]
#[repr(C)]
pub struct Slot<T> {
    version: CacheAligned<AtomicU64>,
    payload: CacheAligned<T>,
}

impl<T: Copy> Slot<T> {
    /// Loads the version stamp with the given ordering.
    #[inline(always)]
    pub fn load_version(&self, order: Ordering) -> u64 {
        self.version.0.load(order)
    }

    /// Stores the version stamp with the given ordering.
    ///
    /// Producer-only. `Ordering::Release` makes the preceding payload write
    /// visible to any reader that acquires this version.
    #[inline(always)]
    pub fn store_version(&self, version: u64, order: Ordering) {
        self.version.0.store(version, order)
    }

    /// Copies the payload out of the slot.
    ///
    /// The copy is volatile: the producer may be overwriting the slot while
    /// it runs, in which case the returned value is torn.
    ///
    /// # Safety
    ///
    /// The caller must discard the result unless a subsequent version
    /// re-check proves the slot was not overwritten during the copy.
    #[inline(always)]
    pub unsafe fn read_payload(&self) -> T {
        unsafe { std::ptr::read_volatile(&self.payload.0) }
    }

    /// Overwrites the payload in place. Producer-only; the write becomes
    /// visible to readers once the matching version store lands.
    #[inline(always)]
    pub fn write_payload(&mut self, value: &T) {
        self.payload.0 = *value;
    }
}

/// Producer-owned metadata region: the id of the most recently completed
/// write. Monotonic, written only by the producer, and off the consumer's
/// hot path (the slot versions alone drive the read protocol).
#[derive(Debug, Default)]
#[repr(C)]
pub struct Info {
    last_block_id: CacheAligned<AtomicU64>,
}

impl Info {
    #[inline(always)]
    pub fn last_block_id(&self) -> &AtomicU64 {
        &self.last_block_id.0
    }
}

/// Bootstrap record the producer publishes under the well-known discovery
/// name: two NUL-terminated identifiers naming the buffer and info regions.
///
/// Fixed 256-byte layout; an identifier that does not fit 127 bytes is a
/// configuration error.
#[repr(C)]
pub struct DiscoveryRecord {
    buffer_path: [u8; PATH_CAPACITY],
    info_path: [u8; PATH_CAPACITY],
}

impl DiscoveryRecord {
    /// Writes both identifiers. Producer-side, before any consumer attaches.
    pub fn publish(&mut self, buffer_path: &str, info_path: &str) -> Result<()> {
        Self::write_field(&mut self.buffer_path, buffer_path)?;
        Self::write_field(&mut self.info_path, info_path)
    }

    /// Identifier of the buffer region, if one was published.
    pub fn buffer_path(&self) -> Option<&str> {
        Self::read_field(&self.buffer_path)
    }

    /// Identifier of the info region, if one was published.
    pub fn info_path(&self) -> Option<&str> {
        Self::read_field(&self.info_path)
    }

    fn write_field(field: &mut [u8; PATH_CAPACITY], path: &str) -> Result<()> {
        let bytes = path.as_bytes();
        if bytes.len() >= PATH_CAPACITY {
            return Err(RingError::PathTooLong {
                path: path.to_owned(),
                limit: PATH_CAPACITY,
            });
        }
        field.fill(0);
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_field(field: &[u8; PATH_CAPACITY]) -> Option<&str> {
        let len = field.iter().position(|&b| b == 0)?;
        if len == 0 {
            return None;
        }
        std::str::from_utf8(&field[..len]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn slot_layout_matches_wire_contract() {
        // Reference configuration: 1024-byte payload.
        type Payload = [u64; 128];
        assert_eq!(offset_of!(Slot<Payload>, version), 0);
        assert_eq!(offset_of!(Slot<Payload>, payload), 64);
        assert_eq!(size_of::<Slot<Payload>>(), 64 + 1024);

        // Small payloads still pad out to full cache lines.
        assert_eq!(offset_of!(Slot<u64>, payload), 64);
        assert_eq!(size_of::<Slot<u64>>(), 128);
    }

    #[test]
    fn info_and_discovery_sizes() {
        assert_eq!(size_of::<Info>(), 64);
        assert_eq!(size_of::<DiscoveryRecord>(), 256);
        assert_eq!(offset_of!(DiscoveryRecord, info_path), PATH_CAPACITY);
    }

    #[test]
    fn generation_tracks_wrap_boundaries() {
        assert_eq!(generation(1), 1);
        assert_eq!(generation(RING_CAPACITY as u64 - 1), 1);
        assert_eq!(generation(RING_CAPACITY as u64), 2);
        assert_eq!(generation(2 * RING_CAPACITY as u64 - 1), 2);
        assert_eq!(generation(2 * RING_CAPACITY as u64), 3);
    }

    #[test]
    fn discovery_round_trip() {
        let mut record = DiscoveryRecord {
            buffer_path: [0; PATH_CAPACITY],
            info_path: [0; PATH_CAPACITY],
        };
        assert!(record.buffer_path().is_none());

        record.publish("/proc/42/fd/7", "/proc/42/fd/8").unwrap();
        assert_eq!(record.buffer_path(), Some("/proc/42/fd/7"));
        assert_eq!(record.info_path(), Some("/proc/42/fd/8"));
    }

    #[test]
    fn discovery_rejects_oversized_identifier() {
        let mut record = DiscoveryRecord {
            buffer_path: [0; PATH_CAPACITY],
            info_path: [0; PATH_CAPACITY],
        };
        let long = "x".repeat(PATH_CAPACITY);
        let err = record.publish(&long, "/ok").unwrap_err();
        assert!(matches!(err, RingError::PathTooLong { limit, .. } if limit == PATH_CAPACITY));
    }

    #[test]
    fn discovery_ignores_unterminated_garbage() {
        let record = DiscoveryRecord {
            buffer_path: [0xff; PATH_CAPACITY],
            info_path: [0; PATH_CAPACITY],
        };
        assert!(record.buffer_path().is_none());
        assert!(record.info_path().is_none());
    }
}
