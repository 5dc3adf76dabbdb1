//! Shared-memory segment pool: a fixed set of System-V segments created at
//! proxy startup, checked out by worker threads for the duration of one
//! chunked transfer and returned to the free-list afterward.
//!
//! Grounded on `shm_init_mem_segs`/`shm_get_mem_seg_ids`/`shm_destroy_mem_segs`
//! for the segment lifecycle, and on `getfile::queue::WorkQueue`'s shape
//! (blocking pop, notify on push) for the free-list itself. It is
//! reimplemented here rather than reused as a generic `WorkQueue<Segment>`
//! because `getfile` already depends on this crate — reusing it would make
//! the dependency cyclic.
//!
//! Only the proxy owns a `SegmentPool` — it is the component that creates
//! the segments (`shm_init_mem_segs`'s contract) and tracks which are free.
//! The cache daemon never builds one: it receives a segment's kernel id over
//! the message queue and attaches to it directly with [`attach_by_id`],
//! exactly as `handle_file_request` calls `shm_attach_mem_seg` straight off
//! `shm_context_get_seg_id`.

use crate::sysv;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// One shared-memory segment's identity and fixed capacity. `id` is the
/// kernel-assigned id `shmget` returned — the same value that travels over
/// the message queue as `IpcContext::mem_seg_id` and feeds the channel
/// selector arithmetic, matching the original's reuse of the raw `shmid` for
/// both purposes. Cheap to copy; the actual memory is attached on demand via
/// [`SegmentPool::attach`] or [`attach_by_id`].
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub id: i32,
    pub capacity: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct Inner {
    free: VecDeque<Segment>,
}

/// Owns the full set of segments for the process's lifetime. Created once by
/// the proxy and shared across worker threads.
pub struct SegmentPool {
    segments: Vec<Segment>,
    state: Mutex<Inner>,
    available: Condvar,
}

impl SegmentPool {
    /// Creates `num_segments` shared-memory segments of `segment_size` bytes
    /// each, keyed off `key_seed + index`. The original C source's seed
    /// (`514332585485642`) overflows a 32-bit `key_t`; this takes a
    /// caller-supplied `i32` seed instead (see the project's design notes
    /// for why no attempt is made to reproduce the overflowing constant).
    pub fn create(key_seed: libc::key_t, num_segments: u16, segment_size: usize) -> Result<Self, Error> {
        let mut segments = Vec::with_capacity(num_segments as usize);
        for index in 0..num_segments {
            let key = key_seed.wrapping_add(index as libc::key_t);
            let shmid = sysv::shmget_create(key, segment_size)?;
            segments.push(Segment {
                id: shmid,
                capacity: segment_size,
            });
        }
        let free = segments.iter().copied().collect();
        Ok(SegmentPool {
            segments,
            state: Mutex::new(Inner { free }),
            available: Condvar::new(),
        })
    }

    pub fn segment_ids(&self) -> Vec<i32> {
        self.segments.iter().map(|s| s.id).collect()
    }

    /// Blocks until a segment is free, then removes it from the free-list.
    pub fn checkout(&self) -> Segment {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(segment) = state.free.pop_front() {
                return segment;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Returns a segment to the free-list and wakes one waiting checkout.
    pub fn release(&self, segment: Segment) {
        let mut state = self.state.lock().unwrap();
        state.free.push_back(segment);
        self.available.notify_one();
    }

    /// Attaches `segment` into this process's address space for the
    /// duration of the returned guard.
    pub fn attach(&self, segment: Segment) -> Result<AttachedSegment, Error> {
        let addr = unsafe { sysv::shmat(segment.id) }?;
        Ok(AttachedSegment { segment, addr })
    }

    /// Destroys every segment in the pool. This consumes `self`, so it can
    /// only be called once.
    pub fn destroy(self) -> Result<(), Error> {
        for segment in &self.segments {
            sysv::shmctl_remove(segment.id)?;
        }
        Ok(())
    }
}

/// Attaches directly to the segment identified by `shmid` and `capacity`,
/// without going through a `SegmentPool`. Used by the cache daemon, which
/// never creates or owns segments of its own — it only ever attaches to
/// whichever one the proxy named in a request.
pub fn attach_by_id(shmid: i32, capacity: usize) -> Result<AttachedSegment, Error> {
    let addr = unsafe { sysv::shmat(shmid) }?;
    Ok(AttachedSegment {
        segment: Segment { id: shmid, capacity },
        addr,
    })
}

/// RAII guard over an attached segment: `shmdt`s on drop. Send because the
/// underlying pointer is only ever read/written through `&self` methods that
/// copy bytes in or out, never aliased mutably, matching how the original C
/// code uses the attached address (one writer and one reader coordinating
/// entirely through the RDY/ACK message protocol, never touching the
/// segment concurrently).
pub struct AttachedSegment {
    segment: Segment,
    addr: *mut libc::c_void,
}

unsafe impl Send for AttachedSegment {}

impl AttachedSegment {
    pub fn segment(&self) -> Segment {
        self.segment
    }

    /// Copies `buf` into the segment at offset 0. `buf.len()` must not
    /// exceed the segment's capacity.
    pub fn write(&self, buf: &[u8]) {
        debug_assert!(buf.len() <= self.segment.capacity);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.addr as *mut u8, buf.len());
        }
    }

    /// Copies `len` bytes out of the segment at offset 0 into a fresh
    /// buffer.
    pub fn read(&self, len: usize) -> Vec<u8> {
        debug_assert!(len <= self.segment.capacity);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr as *const u8, out.as_mut_ptr(), len);
        }
        out
    }
}

impl Drop for AttachedSegment {
    fn drop(&mut self) {
        if let Err(err) = unsafe { sysv::shmdt(self.addr) } {
            log::warn!("failed to detach shared memory segment {}: {err}", self.segment.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_seed() -> libc::key_t {
        (std::process::id() as libc::key_t).wrapping_mul(7).wrapping_add(0x5347)
    }

    #[test]
    #[ignore = "requires System-V IPC permissions; run explicitly in an environment that supports shmget"]
    fn checkout_attach_write_read_release_roundtrip() {
        let pool = SegmentPool::create(unique_seed(), 2, 4096).unwrap();
        let segment = pool.checkout();
        {
            let attached = pool.attach(segment).unwrap();
            attached.write(b"hello");
            assert_eq!(&attached.read(5), b"hello");
        }
        pool.release(segment);
        assert_eq!(pool.checkout().id, segment.id);
        pool.destroy().unwrap();
    }

    #[test]
    #[ignore = "requires System-V IPC permissions; run explicitly in an environment that supports shmget"]
    fn cache_side_attaches_by_raw_id() {
        let pool = SegmentPool::create(unique_seed(), 1, 4096).unwrap();
        let segment = pool.checkout();
        {
            let proxy_side = pool.attach(segment).unwrap();
            proxy_side.write(b"cached");
        }
        let cache_side = attach_by_id(segment.id, segment.capacity).unwrap();
        assert_eq!(&cache_side.read(6), b"cached");
        pool.release(segment);
        pool.destroy().unwrap();
    }

    #[test]
    fn segment_ids_reflect_creation_order() {
        let segments = vec![
            Segment { id: 10, capacity: 10 },
            Segment { id: 11, capacity: 10 },
        ];
        let ids: Vec<i32> = segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![10, 11]);
    }
}
