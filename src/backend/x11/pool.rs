//! Per-window bounded color-buffer pool (§4.3): allocate lazily up to a
//! cap, recycle released buffers at the tail so the least-recently-used
//! buffer is the next one tried, reducing the odds of picking a buffer
//! whose GPU work has not actually finished under the finish-fallback and
//! implicit-sync regimes (where there is no kernel-level wait to fall back
//! on if we guess wrong).

use std::sync::{Arc, Mutex};

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use gbm::BufferObjectFlags as GbmBufferFlags;
use x11rb::rust_connection::RustConnection;

use crate::backend::allocator::dmabuf::{AsDmabuf, Dmabuf};
use crate::backend::allocator::gbm::GbmAllocator;
use crate::backend::drm::RenderDevice;
use crate::error::PoolError;

use super::buffer::{BufferStatus, ColorBuffer};

/// Direct-presentation pool cap (§3 invariants).
pub const DIRECT_CAP: usize = 4;
/// Linear-intermediate pool cap, used only in offload (PRIME) mode.
pub const INTERMEDIATE_CAP: usize = 2;

/// A bounded, lazily-growing set of color buffers, all allocated at the same
/// fixed size/format/modifier.
#[derive(Debug)]
pub struct ColorBufferPool {
    // `None` only ever occurs in tests that pre-fill `buffers` to `cap`, so
    // the lazy-allocation path in `allocate_one` never has to run.
    allocator: Option<Arc<Mutex<GbmAllocator<RenderDevice>>>>,
    buffers: Vec<ColorBuffer>,
    cap: usize,
    width: u32,
    height: u32,
    format: Fourcc,
    modifier: Modifier,
    flags: GbmBufferFlags,
}

impl ColorBufferPool {
    /// Creates an empty pool; buffers are allocated lazily by
    /// [`acquire_idle`](Self::acquire_idle).
    pub fn new(
        allocator: Arc<Mutex<GbmAllocator<RenderDevice>>>,
        cap: usize,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
        flags: GbmBufferFlags,
    ) -> Self {
        ColorBufferPool {
            allocator: Some(allocator),
            buffers: Vec::with_capacity(cap),
            cap,
            width,
            height,
            format,
            modifier,
            flags,
        }
    }

    /// Maximum number of buffers this pool will hold.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of buffers currently allocated (may be less than `cap`).
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers yet.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Index of an `Idle` buffer, excluding `exclude`, allocating a fresh
    /// one if the pool has not reached `cap` and none is free. Returns
    /// `Ok(None)` when the pool is at capacity and every buffer is busy —
    /// the caller must wait on the event pump / sync primitive and retry.
    pub fn acquire_idle(&mut self, exclude: Option<usize>) -> Result<Option<usize>, PoolError> {
        if let Some(idx) = self
            .buffers
            .iter()
            .enumerate()
            .find(|&(i, b)| Some(i) != exclude && b.status() == BufferStatus::Idle)
            .map(|(i, _)| i)
        {
            return Ok(Some(idx));
        }

        if self.buffers.len() < self.cap {
            let dmabuf = self.allocate_one()?;
            self.buffers.push(ColorBuffer::new(dmabuf));
            return Ok(Some(self.buffers.len() - 1));
        }

        Ok(None)
    }

    fn allocate_one(&mut self) -> Result<Dmabuf, PoolError> {
        let allocator = self.allocator.as_ref().expect("pool has no allocator bound");
        let mut allocator = allocator.lock().unwrap();
        let bo = allocator
            .create_buffer_with_flags(self.width, self.height, self.format, &[self.modifier], self.flags)
            .map_err(PoolError::OpenDevice)?;
        bo.export().map_err(PoolError::Allocation)
    }

    /// Borrows the buffer at `idx`.
    pub fn get(&self, idx: usize) -> &ColorBuffer {
        &self.buffers[idx]
    }

    /// Mutably borrows the buffer at `idx`.
    pub fn get_mut(&mut self, idx: usize) -> &mut ColorBuffer {
        &mut self.buffers[idx]
    }

    /// Every buffer currently not `Idle`, with its index — the set a
    /// free-buffer wait needs to watch.
    pub fn busy_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status() != BufferStatus::Idle)
            .map(|(i, _)| i)
    }

    /// Every buffer in `IdleNotified` (implicit-sync regime: released by the
    /// server, not yet confirmed free by the dma-buf fence).
    pub fn idle_notified_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status() == BufferStatus::IdleNotified)
            .map(|(i, _)| i)
    }

    /// Finds the buffer an `IdleNotify(pixmap, serial)` event refers to.
    pub fn find_by_pixmap_and_serial(&self, pixmap: u32, serial: u32) -> Option<usize> {
        self.buffers
            .iter()
            .position(|b| b.pixmap_xid() == Some(pixmap) && b.last_serial() == Some(serial))
    }

    /// Moves the buffer at `idx` to the tail of the pool (LRU re-use order)
    /// and marks it with the recycling status the sync regime calls for.
    pub fn recycle_to_tail(&mut self, idx: usize, status: BufferStatus) {
        let mut buf = self.buffers.remove(idx);
        match status {
            BufferStatus::Idle => buf.mark_idle(),
            BufferStatus::IdleNotified => buf.mark_idle_notified(),
            BufferStatus::InUse => {
                debug_assert!(false, "recycle_to_tail called with a busy status");
            }
        }
        self.buffers.push(buf);
    }

    /// Frees every buffer's shared pixmap on the server, drops the buffers
    /// (their `Drop` impls free the dmabuf handles, driver tokens, and any
    /// owned timeline), and resets allocation parameters for the next
    /// size/modifier, per §4.5.2 reallocation.
    pub fn reallocate(&mut self, connection: &RustConnection, width: u32, height: u32, modifier: Modifier) {
        for mut buf in self.buffers.drain(..) {
            buf.invalidate_pixmap(connection);
        }
        self.width = width;
        self.height = height;
        self.modifier = modifier;
    }

    /// The fixed modifier every buffer in this pool is allocated with.
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::dmabuf::DmabufFlags;
    use crate::backend::allocator::Format;
    use std::fs::File;

    /// A buffer with one plane backed by `/dev/null`, good enough to drive
    /// pool bookkeeping without touching a real GPU.
    fn dummy_buffer() -> ColorBuffer {
        let fd = File::open("/dev/null").unwrap();
        let mut builder = Dmabuf::builder_from_buffer(
            &DummySized,
            DmabufFlags::empty(),
        );
        builder.add_plane(fd.into(), 0, 0, 4);
        ColorBuffer::new(builder.build().unwrap())
    }

    struct DummySized;
    impl crate::backend::allocator::Buffer for DummySized {
        fn size(&self) -> crate::utils::Size<i32, crate::utils::Buffer> {
            (4, 4).into()
        }
        fn format(&self) -> Format {
            Format {
                code: Fourcc::Argb8888,
                modifier: Modifier::Linear,
            }
        }
    }

    fn buffers(n: usize) -> Vec<ColorBuffer> {
        (0..n).map(|_| dummy_buffer()).collect()
    }

    #[test]
    fn recycle_moves_to_tail_and_marks_idle() {
        let mut bufs = buffers(3);
        bufs[0].mark_in_use(1);
        bufs[1].mark_in_use(2);

        let mut pool = ColorBufferPool {
            allocator: None,
            buffers: bufs,
            cap: 3,
            width: 4,
            height: 4,
            format: Fourcc::Argb8888,
            modifier: Modifier::Linear,
            flags: GbmBufferFlags::empty(),
        };

        pool.recycle_to_tail(0, BufferStatus::Idle);
        assert_eq!(pool.get(2).status(), BufferStatus::Idle);
        assert_eq!(pool.get(0).status(), BufferStatus::InUse);
    }

    #[test]
    fn acquire_idle_skips_excluded_and_busy_buffers() {
        let mut bufs = buffers(2);
        bufs[0].mark_in_use(1);

        let mut pool = ColorBufferPool {
            allocator: None,
            buffers: bufs,
            cap: 2,
            width: 4,
            height: 4,
            format: Fourcc::Argb8888,
            modifier: Modifier::Linear,
            flags: GbmBufferFlags::empty(),
        };

        assert_eq!(pool.acquire_idle(None).unwrap(), Some(1));
        assert_eq!(pool.acquire_idle(Some(1)).unwrap(), None);
    }

    #[test]
    fn find_by_pixmap_and_serial_matches_submitted_buffer() {
        let mut bufs = buffers(1);
        bufs[0].mark_in_use(7);
        bufs[0].set_pixmap_xid_for_test(42);

        let pool = ColorBufferPool {
            allocator: None,
            buffers: bufs,
            cap: 1,
            width: 4,
            height: 4,
            format: Fourcc::Argb8888,
            modifier: Modifier::Linear,
            flags: GbmBufferFlags::empty(),
        };

        assert_eq!(pool.find_by_pixmap_and_serial(42, 7), Some(0));
        assert_eq!(pool.find_by_pixmap_and_serial(42, 8), None);
        assert_eq!(pool.find_by_pixmap_and_serial(1, 7), None);
    }
}
