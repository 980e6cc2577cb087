//! DRM timeline syncobjs shared between this process and the X server via
//! the DRI3 `ImportSyncobj`/`FreeSyncobj` requests.
//!
//! A [`Timeline`] tracks one monotonically increasing `point`. Submitting a
//! frame signals `point + 1` once the driver's rendering fence for that
//! frame retires; waiting for a buffer to become free waits for the
//! `point` recorded when it was last presented.

use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use drm::control::{syncobj::Handle as SyncobjHandle, Device as ControlDevice};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::Window as Xid;
use x11rb::rust_connection::RustConnection;

use crate::backend::drm::RenderDevice;
use crate::error::TimelineError;

/// One DRM timeline syncobj, registered with the X server under `xid`.
#[derive(Debug)]
pub struct Timeline {
    device: Arc<RenderDevice>,
    connection: Arc<RustConnection>,
    /// The id the server knows this syncobj by (the argument to
    /// `ImportSyncobj`/`FreeSyncobj`).
    xid: u32,
    handle: SyncobjHandle,
    /// The last point this process has signalled or is about to signal.
    point: u64,
}

impl Timeline {
    /// Creates a new kernel syncobj and registers it with the server for
    /// `window`.
    pub fn new(
        device: Arc<RenderDevice>,
        connection: Arc<RustConnection>,
        window: Xid,
    ) -> Result<Self, TimelineError> {
        let handle = device
            .create_syncobj(false)
            .map_err(TimelineError::AllocFailure)?;

        let xid = connection.generate_id().map_err(|_| TimelineError::SyncFailure)?;

        let import = scopeguard::guard(handle, |handle| {
            let _ = device.destroy_syncobj(handle);
        });

        let handle_fd = device
            .syncobj_to_fd(*import, false)
            .map_err(TimelineError::AllocFailure)?;

        connection
            .dri3_import_syncobj(xid, window, handle_fd)
            .and_then(|cookie| cookie.check())
            .map_err(|_| TimelineError::SyncFailure)?;

        Ok(Timeline {
            device,
            connection,
            xid,
            handle: scopeguard::ScopeGuard::into_inner(import),
            point: 0,
        })
    }

    /// The id the server uses to refer to this syncobj (the `acquire`/
    /// `release` argument of `PresentPixmapSynced`).
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// The point a newly submitted frame's release fence will land on.
    pub fn point(&self) -> u64 {
        self.point
    }

    /// Reserves the acquire/release pair `(point, point + 1)` a Present
    /// request needs for the frame about to be submitted, and attaches the
    /// rendering completion fence at the acquire point.
    ///
    /// `fence` is the driver's native-fence-sync fd for the work that
    /// rendered into the presented buffer, already flushed and duplicated
    /// by the caller. When `fence` is `None` (the driver could not produce
    /// one), the acquire point is signalled manually instead so the
    /// timeline still advances and the server's wait on it does not hang
    /// forever — correct but loses the ordering guarantee a real fence
    /// would have given.
    ///
    /// Only advances `self.point` once the fence has actually been
    /// transferred (or manually signalled); a failure here leaves the
    /// timeline at its previous point so a retried swap does not skip
    /// acquire points.
    pub fn reserve_next(&mut self, fence: Option<OwnedFd>) -> Result<(u64, u64), TimelineError> {
        let acquire = self.point;
        let release = acquire + 1;
        match fence {
            Some(fd) => self.import_fence_at(fd, acquire)?,
            None => self.signal_at(acquire)?,
        }
        self.point = release;
        Ok((acquire, release))
    }

    /// Exports the *current* point (not `point + 1`) as a sync file, for
    /// handing the driver's rendering fence to the kernel/GPU.
    ///
    /// Per the DRM syncobj transfer ordering: a temporary syncobj receives
    /// the current point, is exported, and is destroyed unconditionally
    /// regardless of whether the export succeeded.
    pub fn export_sync_file(&self) -> Result<OwnedFd, TimelineError> {
        let temp = self
            .device
            .create_syncobj(false)
            .map_err(TimelineError::AllocFailure)?;
        let temp = scopeguard::guard(temp, |temp| {
            let _ = self.device.destroy_syncobj(temp);
        });

        self.device
            .syncobj_timeline_transfer(self.handle, *temp, self.point, 0)
            .map_err(TimelineError::AllocFailure)?;

        self.device
            .syncobj_to_fd(*temp, true)
            .map_err(|_| TimelineError::SyncFailure)
    }

    /// Imports an externally-produced sync file fd (the driver's
    /// native-fence sync for the frame) into this timeline at `point`.
    ///
    /// The temporary syncobj used to stage the fd is always destroyed,
    /// whether or not the transfer into `self.handle` succeeds.
    fn import_fence_at(&self, fd: OwnedFd, point: u64) -> Result<(), TimelineError> {
        use std::os::unix::io::AsFd;

        let temp = self
            .device
            .fd_to_syncobj(fd.as_fd(), true)
            .map_err(TimelineError::AllocFailure)?;
        let temp = scopeguard::guard(temp, |temp| {
            let _ = self.device.destroy_syncobj(temp);
        });

        self.device
            .syncobj_timeline_transfer(*temp, self.handle, 0, point)
            .map_err(TimelineError::AllocFailure)
    }

    /// Manually signals `point` with no external fence backing it. Used
    /// when the driver could not hand over a native-fence sync file, so
    /// the timeline still advances and waiters on this point are not stuck
    /// forever.
    fn signal_at(&self, point: u64) -> Result<(), TimelineError> {
        self.device
            .syncobj_timeline_signal(&[self.handle], &[point])
            .map_err(TimelineError::AllocFailure)
    }

    /// Waits up to `timeout_ms` for `point` to become available (not
    /// necessarily signalled yet, just guaranteed to eventually signal),
    /// matching the `WAIT_AVAILABLE` semantics the free-buffer acquisition
    /// path relies on.
    pub fn wait_available(&self, point: u64, timeout_ms: u64) -> Result<(), TimelineError> {
        let timeout_ns = (timeout_ms as i64).saturating_mul(1_000_000);
        self.device
            .syncobj_timeline_wait(&[self.handle], &[point], timeout_ns, false, true, false)
            .map(|_| ())
            .map_err(TimelineError::AllocFailure)
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        let _ = self.connection.dri3_free_syncobj(self.xid);
        let _ = self.device.destroy_syncobj(self.handle);
    }
}
