//! Color buffers: a driver-rendered [`Dmabuf`] paired with the pool
//! bookkeeping needed to know when it is safe to reuse, plus the DRI3
//! machinery that turns one into a shared pixmap the server can scan out.

use drm_fourcc::DrmFourcc;
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, Window as Xid};
use x11rb::rust_connection::RustConnection;

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::allocator::Buffer as _;
use crate::backend::x11::timeline::Timeline;
use crate::error::PresentError;
use crate::external::DriverColorBuffer;

/// Where a color buffer sits in its present/release lifecycle.
///
/// `Idle -> InUse` happens when a frame is submitted; `InUse -> Idle`
/// happens once the server (and, for implicit sync, the kernel fence) say
/// the buffer is free. `IdleNotified` is an intermediate step only the
/// implicit-sync regime uses: the server's `IdleNotify` fired, but the
/// dma-buf's implicit fence may not have retired yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Free to allocate for a new frame.
    Idle,
    /// Submitted to the server, not yet known to be free.
    InUse,
    /// The server released it, but the implicit-sync regime still has to
    /// confirm the dma-buf's fence is retired before reuse.
    IdleNotified,
}

/// A driver color buffer token paired with the callback that releases it,
/// so the driver is asked to free it exactly once: when the owning
/// [`ColorBuffer`] drops the token, or replaces it with a freshly imported
/// one (e.g. after a reallocation changes the underlying dmabuf).
struct DriverToken {
    buffer: Option<Box<dyn DriverColorBuffer>>,
    free: fn(Box<dyn DriverColorBuffer>),
}

impl std::fmt::Debug for DriverToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverToken").finish_non_exhaustive()
    }
}

impl Drop for DriverToken {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            (self.free)(buffer);
        }
    }
}

/// A driver-rendered buffer tracked by the buffer pool.
#[derive(Debug)]
pub struct ColorBuffer {
    dmabuf: Dmabuf,
    status: BufferStatus,
    /// The Present serial this buffer was last submitted under; used to
    /// correlate `CompleteNotify`/`IdleNotify` events back to this buffer.
    last_serial: Option<u32>,
    /// The lazily-created shared pixmap backing this buffer on the server,
    /// and the id the server released it under (valid for this buffer's
    /// current pixmap only).
    pixmap: Option<u32>,
    /// Present under explicit sync: one timeline syncobj per buffer, created
    /// the first time this buffer becomes a presentation target. `None` for
    /// buffers that never participate in explicit sync (implicit/finish
    /// regimes, or linear intermediates that are only ever GPU-blit targets).
    timeline: Option<Timeline>,
    /// The driver-opaque color buffer this dmabuf was imported as, lazily
    /// created the first time the driver needs to render into or read from
    /// this buffer. `None` until the whole `ColorBuffer` is dropped (e.g. by
    /// a reallocation replacing it), at which point `DriverToken`'s own
    /// `Drop` impl asks the driver to free it.
    driver_token: Option<DriverToken>,
}

impl ColorBuffer {
    /// Wraps a freshly allocated buffer. Starts `Idle`.
    pub fn new(dmabuf: Dmabuf) -> Self {
        ColorBuffer {
            dmabuf,
            status: BufferStatus::Idle,
            last_serial: None,
            pixmap: None,
            timeline: None,
            driver_token: None,
        }
    }

    /// The buffer's timeline, if one has been created yet.
    pub fn timeline(&self) -> Option<&Timeline> {
        self.timeline.as_ref()
    }

    /// Lazily creates this buffer's timeline syncobj, registering it with
    /// the server for `window`.
    pub fn ensure_timeline(
        &mut self,
        device: std::sync::Arc<crate::backend::drm::RenderDevice>,
        connection: std::sync::Arc<RustConnection>,
        window: Xid,
    ) -> Result<&mut Timeline, crate::error::TimelineError> {
        if self.timeline.is_none() {
            self.timeline = Some(Timeline::new(device, connection, window)?);
        }
        Ok(self.timeline.as_mut().unwrap())
    }

    /// The underlying dmabuf.
    pub fn dmabuf(&self) -> &Dmabuf {
        &self.dmabuf
    }

    /// Current pool status.
    pub fn status(&self) -> BufferStatus {
        self.status
    }

    /// Marks this buffer as submitted under `serial`, dropping any stale
    /// shared pixmap: the server does not let us present the same
    /// `xid` XID to a resized window, but the pixmap is still retained
    /// across consecutive presents to the same geometry.
    pub fn mark_in_use(&mut self, serial: u32) {
        self.status = BufferStatus::InUse;
        self.last_serial = Some(serial);
    }

    /// Marks this buffer free to be handed out by the pool again.
    pub fn mark_idle(&mut self) {
        self.status = BufferStatus::Idle;
    }

    /// Marks this buffer released by the server but still implicit-sync
    /// pending.
    pub fn mark_idle_notified(&mut self) {
        self.status = BufferStatus::IdleNotified;
    }

    /// The serial this buffer was last presented under.
    pub fn last_serial(&self) -> Option<u32> {
        self.last_serial
    }

    /// Frees the cached shared pixmap on the server and drops its xid, e.g.
    /// once a reallocation makes this buffer's old geometry stale. A no-op
    /// if no pixmap has been created yet.
    pub fn invalidate_pixmap(&mut self, connection: &RustConnection) {
        if let Some(xid) = self.pixmap.take() {
            let _ = connection.free_pixmap(xid);
        }
    }

    /// The driver color buffer backing this dmabuf, if the driver has
    /// already been asked to import it.
    pub fn driver_token(&self) -> Option<&dyn DriverColorBuffer> {
        self.driver_token.as_ref().and_then(|token| token.buffer.as_deref())
    }

    /// Lazily imports this buffer's dmabuf through the driver, caching the
    /// resulting token so repeated calls are a no-op. `free` is stashed
    /// alongside the token so it is invoked exactly once the token is
    /// dropped or invalidated.
    pub fn ensure_driver_token(
        &mut self,
        import: fn(&Dmabuf) -> Box<dyn DriverColorBuffer>,
        free: fn(Box<dyn DriverColorBuffer>),
    ) -> &dyn DriverColorBuffer {
        if self.driver_token.is_none() {
            self.driver_token = Some(DriverToken {
                buffer: Some(import(&self.dmabuf)),
                free,
            });
        }
        self.driver_token.as_ref().unwrap().buffer.as_deref().unwrap()
    }

    /// The server-side pixmap xid backing this buffer, if one has already
    /// been created for its current geometry.
    pub fn pixmap_xid(&self) -> Option<u32> {
        self.pixmap
    }

    /// Lazily creates (or returns the cached) shared pixmap for this
    /// buffer, importing the dmabuf via DRI3.
    pub fn ensure_pixmap(
        &mut self,
        connection: &RustConnection,
        window: Xid,
        depth: u8,
        dri3_supports_multiplane: bool,
    ) -> Result<u32, PresentError> {
        if let Some(xid) = self.pixmap {
            return Ok(xid);
        }

        let xid = create_shared_pixmap(connection, window, &self.dmabuf, depth, dri3_supports_multiplane)?;
        self.pixmap = Some(xid);
        Ok(xid)
    }

    #[cfg(test)]
    pub(crate) fn set_pixmap_xid_for_test(&mut self, xid: u32) {
        self.pixmap = Some(xid);
    }
}

/// Depth/bits-per-pixel pair `PixmapFromBuffers`/`PixmapFromBuffer` need,
/// derived from the fourcc code. The color-format enumeration table this
/// is ultimately sourced from lives outside this crate; this mapping only
/// covers the two formats DRI3 shared pixmaps are ever created with.
fn depth_bpp(format: DrmFourcc) -> Result<(u8, u8), PresentError> {
    match format {
        DrmFourcc::Argb8888 => Ok((32, 32)),
        DrmFourcc::Xrgb8888 => Ok((24, 32)),
        _ => Err(PresentError::IncorrectFormat),
    }
}

/// Imports `dmabuf` as a new pixmap on `window`'s connection via DRI3,
/// duplicating its plane fds first since XCB closes whatever fd it is
/// handed after sending the request.
fn create_shared_pixmap(
    connection: &RustConnection,
    window: Xid,
    dmabuf: &Dmabuf,
    depth: u8,
    dri3_supports_multiplane: bool,
) -> Result<u32, PresentError> {
    let (_, bpp) = depth_bpp(dmabuf.format().code)?;

    let mut fds = Vec::with_capacity(dmabuf.num_planes());
    for handle in dmabuf.handles() {
        let fd = rustix::io::fcntl_dupfd_cloexec(unsafe { std::os::unix::io::BorrowedFd::borrow_raw(handle) }, 3)
            .map_err(|err| PresentError::DupFailed(err.to_string()))?;
        fds.push(fd);
    }

    let size = dmabuf.size();
    let xid = connection
        .generate_id()
        .map_err(|err| PresentError::Protocol(err.to_string()))?;

    if dri3_supports_multiplane {
        if dmabuf.num_planes() > 4 {
            return Err(PresentError::TooManyPlanes);
        }

        let mut strides = dmabuf.strides();
        let mut offsets = dmabuf.offsets();

        connection
            .dri3_pixmap_from_buffers(
                xid,
                window,
                size.w as u16,
                size.h as u16,
                strides.next().unwrap_or(0),
                offsets.next().unwrap_or(0),
                strides.next().unwrap_or(x11rb::NONE),
                offsets.next().unwrap_or(x11rb::NONE),
                strides.next().unwrap_or(x11rb::NONE),
                offsets.next().unwrap_or(x11rb::NONE),
                strides.next().unwrap_or(x11rb::NONE),
                offsets.next().unwrap_or(x11rb::NONE),
                depth,
                bpp,
                u64::from(dmabuf.format().modifier),
                fds,
            )
            .map_err(|err| PresentError::Protocol(err.to_string()))?;
    } else {
        if dmabuf.num_planes() != 1 {
            return Err(PresentError::TooManyPlanes);
        }

        let stride = dmabuf.strides().next().unwrap_or(0);
        connection
            .dri3_pixmap_from_buffer(
                xid,
                window,
                size.h as u32 * stride,
                size.w as u16,
                size.h as u16,
                stride as u16,
                depth,
                bpp,
                fds.into_iter().next().expect("single-plane dmabuf has a plane"),
            )
            .map_err(|err| PresentError::Protocol(err.to_string()))?;
    }

    Ok(xid)
}
