//! Publishing and discovering rings over shared memory.
//!
//! A ring is advertised under a well-known name: the producer creates a
//! small discovery region at `"/{name}_rb_fd"` holding the identifiers of
//! two anonymous memfd regions (the slot buffer and the info cell), which
//! consumers open through `/proc/<pid>/fd/<fd>` and map read-only. The
//! discovery region lives as long as the producer and is unlinked when it
//! drops; the memfds die with the producer process.

use std::marker::PhantomData;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, RingError};
use crate::layout::{DiscoveryRecord, Info, Slot, INDEX_MASK, RING_CAPACITY};
use crate::ring::{Consumer, Producer, RingMem};
use crate::shm;

/// Creates and publishes a ring, returning its single producer.
///
/// Fails on an invalid name or any shared-memory failure; such failures are
/// configuration or OS problems with no retry policy, so callers normally
/// report them and exit. A discovery region left over from a crashed
/// producer of the same name is reused.
pub fn create_producer<T: Copy + Send>(name: &str) -> Result<Producer<T, ShmRing<T>>> {
    Ok(Producer::new(Arc::new(ShmRing::create(name)?)))
}

/// Opens a published ring read-only and returns a consumer, already caught
/// up to the producer's most recent wrap boundary.
///
/// Any number of consumers may attach, including while the producer is
/// actively writing. Additional same-process consumers can also be created
/// by cloning the returned one.
pub fn open_consumer<T: Copy + Send>(name: &str) -> Result<Consumer<T, ShmRing<T>>> {
    Ok(Consumer::new(Arc::new(ShmRing::open(name)?)))
}

#[derive(Debug)]
enum Role {
    /// Created the regions; owns the memfds and unlinks discovery on drop.
    Producer { buffer_fd: RawFd, info_fd: RawFd },
    /// Mapped everything read-only.
    Consumer,
}

/// Ring storage mapped from the three shared-memory regions.
///
/// Producer-side the buffer and info regions are writable and the memfds
/// are held open so the advertised `/proc` identifiers stay valid;
/// consumer-side everything is mapped read-only.
#[derive(Debug)]
pub struct ShmRing<T> {
    slots: NonNull<Slot<T>>,
    slots_len: usize,
    info: NonNull<Info>,
    info_len: usize,
    discovery: NonNull<DiscoveryRecord>,
    discovery_name: String,
    role: Role,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ShmRing<T> {}
unsafe impl<T: Send> Sync for ShmRing<T> {}

impl<T> ShmRing<T> {
    fn create(name: &str) -> Result<Self> {
        let discovery_name = discovery_shm_name(name)?;
        let discovery_ptr = shm::shm_create(&discovery_name, size_of::<DiscoveryRecord>())
            .map_err(|source| RingError::Os {
                op: "shm_open",
                path: discovery_name.clone(),
                source,
            })?;
        let mut discovery: NonNull<DiscoveryRecord> = discovery_ptr.cast();

        let slots_bytes = RING_CAPACITY * size_of::<Slot<T>>();
        let buffer = shm::memfd_region("ringcast-buffer", slots_bytes, true).map_err(|source| {
            RingError::Os {
                op: "memfd_create",
                path: format!("{name} buffer"),
                source,
            }
        })?;
        let info = shm::memfd_region("ringcast-info", size_of::<Info>(), false).map_err(
            |source| RingError::Os {
                op: "memfd_create",
                path: format!("{name} info"),
                source,
            },
        )?;

        let ring = Self {
            slots: buffer.ptr.cast(),
            slots_len: buffer.len,
            info: info.ptr.cast(),
            info_len: info.len,
            discovery,
            discovery_name,
            role: Role::Producer {
                buffer_fd: buffer.fd,
                info_fd: info.fd,
            },
            _marker: PhantomData,
        };

        // Fresh memfds are already zeroed; make the starting state explicit
        // anyway before the ring becomes discoverable.
        ring.last_block_id().store(0, Ordering::Release);

        let pid = std::process::id();
        let buffer_path = format!("/proc/{pid}/fd/{}", buffer.fd);
        let info_path = format!("/proc/{pid}/fd/{}", info.fd);
        unsafe { discovery.as_mut() }.publish(&buffer_path, &info_path)?;

        tracing::info!(name, buffer = %buffer_path, info = %info_path, "ring published");
        Ok(ring)
    }

    fn open(name: &str) -> Result<Self> {
        let discovery_name = discovery_shm_name(name)?;
        let discovery_ptr = shm::shm_open_ro(&discovery_name, size_of::<DiscoveryRecord>())
            .map_err(|source| RingError::Os {
                op: "shm_open",
                path: discovery_name.clone(),
                source,
            })?;
        let discovery: NonNull<DiscoveryRecord> = discovery_ptr.cast();

        let record = unsafe { discovery.as_ref() };
        let buffer_path = record
            .buffer_path()
            .ok_or_else(|| RingError::MissingPath {
                name: name.to_owned(),
                field: "buffer",
            })?
            .to_owned();
        let info_path = record
            .info_path()
            .ok_or_else(|| RingError::MissingPath {
                name: name.to_owned(),
                field: "info",
            })?
            .to_owned();

        let (slots, slots_len) = map_region_ro(&buffer_path, RING_CAPACITY * size_of::<Slot<T>>())?;
        let (info, info_len) = map_region_ro(&info_path, size_of::<Info>())?;

        tracing::debug!(name, buffer = %buffer_path, info = %info_path, "ring attached");
        Ok(Self {
            slots: slots.cast(),
            slots_len,
            info: info.cast(),
            info_len,
            discovery,
            discovery_name,
            role: Role::Consumer,
            _marker: PhantomData,
        })
    }
}

impl<T> RingMem<T> for ShmRing<T> {
    #[inline(always)]
    unsafe fn slot(&self, id: u64) -> &Slot<T> {
        unsafe { self.slots.add((id & INDEX_MASK) as usize).as_ref() }
    }

    #[inline(always)]
    unsafe fn slot_mut(&self, id: u64) -> &mut Slot<T> {
        unsafe { self.slots.add((id & INDEX_MASK) as usize).as_mut() }
    }

    #[inline(always)]
    fn last_block_id(&self) -> &AtomicU64 {
        unsafe { self.info.as_ref() }.last_block_id()
    }
}

impl<T> Drop for ShmRing<T> {
    /// Unmaps all three regions; the producer side also closes its memfds
    /// and unlinks the discovery region so the ring disappears from the
    /// namespace.
    ///
    /// # Panics
    ///
    /// Panics if unmapping fails; a half-released shared mapping is
    /// unrecoverable.
    fn drop(&mut self) {
        unsafe {
            shm::unmap(self.slots.cast(), self.slots_len).expect("ShmRing::drop: buffer munmap");
            shm::unmap(self.info.cast(), self.info_len).expect("ShmRing::drop: info munmap");
            shm::unmap(self.discovery.cast(), size_of::<DiscoveryRecord>())
                .expect("ShmRing::drop: discovery munmap");
        }
        if let Role::Producer {
            buffer_fd,
            info_fd,
        } = self.role
        {
            shm::close(buffer_fd);
            shm::close(info_fd);
            if let Err(err) = shm::shm_unlink(&self.discovery_name) {
                tracing::warn!(name = %self.discovery_name, %err, "shm_unlink failed");
            } else {
                tracing::info!(name = %self.discovery_name, "ring unpublished");
            }
        }
    }
}

/// Shared-memory object name the discovery region is advertised under.
fn discovery_shm_name(name: &str) -> Result<String> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.contains('/') {
        Some("must not contain '/'")
    } else if name.contains('\0') {
        Some("must not contain NUL")
    } else if name.len() > 200 {
        Some("too long for a shared-memory object name")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(RingError::InvalidName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(format!("/{name}_rb_fd")),
    }
}

/// Opens `path` read-only, validates its size against the compiled-in
/// layout and maps the whole file.
fn map_region_ro(path: &str, expected: usize) -> Result<(NonNull<u8>, usize)> {
    let fd = shm::open_ro(path).map_err(|source| RingError::Os {
        op: "open",
        path: path.to_owned(),
        source,
    })?;
    let actual = match shm::fd_size(fd) {
        Ok(size) => size,
        Err(source) => {
            shm::close(fd);
            return Err(RingError::Os {
                op: "fstat",
                path: path.to_owned(),
                source,
            });
        }
    };
    if actual < expected as u64 {
        shm::close(fd);
        return Err(RingError::RegionTooSmall {
            path: path.to_owned(),
            expected: expected as u64,
            actual,
        });
    }
    let mapping = shm::map_ro(fd, actual as usize);
    shm::close(fd);
    match mapping {
        Ok(ptr) => Ok((ptr, actual as usize)),
        Err(source) => Err(RingError::Os {
            op: "mmap",
            path: path.to_owned(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ReadStatus;

    fn unique_name(tag: &str) -> String {
        format!("ringcast-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn rejects_unusable_names() {
        assert!(matches!(
            create_producer::<u64>("").unwrap_err(),
            RingError::InvalidName { .. }
        ));
        assert!(matches!(
            create_producer::<u64>("a/b").unwrap_err(),
            RingError::InvalidName { .. }
        ));
        assert!(matches!(
            open_consumer::<u64>("with\0nul").unwrap_err(),
            RingError::InvalidName { .. }
        ));
    }

    #[test]
    fn consumer_requires_published_ring() {
        let err = open_consumer::<u64>(&unique_name("absent")).unwrap_err();
        assert!(matches!(err, RingError::Os { op: "shm_open", .. }));
    }

    #[test]
    fn shm_round_trip() {
        let name = unique_name("roundtrip");
        let tx = create_producer::<u64>(&name).unwrap();
        let mut rx = open_consumer::<u64>(&name).unwrap();

        let mut out = 0u64;
        assert_eq!(rx.pop(&mut out), ReadStatus::NoNew);

        for i in 1..=100u64 {
            tx.push(&i);
        }
        for i in 1..=100u64 {
            assert_eq!(rx.pop(&mut out), ReadStatus::New);
            assert_eq!(out, i);
        }
        assert_eq!(rx.pop(&mut out), ReadStatus::NoNew);
        assert_eq!(rx.last_block_id(), 100);
    }

    #[test]
    fn late_consumer_attaches_caught_up() {
        let name = unique_name("late");
        let tx = create_producer::<u64>(&name).unwrap();
        for i in 1..=500u64 {
            tx.push(&i);
        }

        let mut rx = open_consumer::<u64>(&name).unwrap();
        assert_eq!(rx.id(), 501);

        let mut out = 0u64;
        assert_eq!(rx.pop(&mut out), ReadStatus::NoNew);
        tx.push(&501);
        assert_eq!(rx.pop(&mut out), ReadStatus::New);
        assert_eq!(out, 501);
    }

    #[test]
    fn region_size_guard_catches_layout_mismatch() {
        let name = unique_name("mismatch");
        let _tx = create_producer::<u64>(&name).unwrap();

        // A consumer compiled with a larger payload type must refuse to
        // attach rather than read past the producer's region.
        let err = open_consumer::<[u64; 128]>(&name).unwrap_err();
        assert!(matches!(err, RingError::RegionTooSmall { .. }));
    }
}
