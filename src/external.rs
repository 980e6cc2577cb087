//! Narrow trait and struct boundaries for the collaborators this crate does
//! not implement: the driver entry-point loader, the color-format
//! enumeration table, `EGLConfig` translation, pixmap surfaces, the
//! Xlib-vs-XCB connection wrapper, and the driver's own error channel.
//!
//! Everything in this module is a boundary the host driver is expected to
//! implement or provide; this crate only calls through it.

use std::fmt;
use std::sync::Arc;

use x11rb::protocol::xproto::Window as Xid;
use x11rb::rust_connection::RustConnection;

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::error::AdapterError;

/// A native X11 window handle, and the connection it lives on.
///
/// The Xlib-vs-XCB wrapper and the lifetime of the underlying display
/// connection belong to the caller; this crate only ever borrows it.
pub trait NativeWindowHandle: fmt::Debug {
    /// The window's X11 resource id.
    fn xid(&self) -> Xid;

    /// The XCB connection the window was created on.
    fn connection(&self) -> &Arc<RustConnection>;
}

/// An opaque, driver-owned color buffer (an EGLConfig-typed renderbuffer or
/// similar). This crate never looks inside one; it only tracks which native
/// buffer object backs it and hands the pair back to the driver.
pub trait DriverColorBuffer: fmt::Debug + Send + Sync {}

/// Format/visual information resolved by the color-format enumeration table
/// this crate does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// The fourcc code this format corresponds to.
    pub fourcc: drm_fourcc::DrmFourcc,
    /// Depth in bits, as used by `CreatePixmap`/`PixmapFromBuffers`.
    pub depth: u8,
    /// Bits-per-pixel, as used by `PixmapFromBuffers`.
    pub bpp: u8,
}

/// Opaque identifier for a driver-side `EGLConfig`, passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EglConfigId(pub u32);

/// The "driver interface exposed upward" from §6: function pointers the host
/// driver supplies, mirroring its own C vtable shape rather than a trait
/// object, so this crate never imposes dynamic dispatch the driver itself
/// doesn't use. `W` is the driver's own opaque per-window handle type.
///
/// Every method here is a raw `fn` pointer (no captured state) to match a
/// real driver vtable; anything stateful a callback needs travels as an
/// explicit argument instead of a closure environment.
pub struct DriverCallbacks<W> {
    /// Imports a dma-buf as a driver color buffer, for a buffer this crate
    /// allocated itself (GBM) and wants the driver to be able to render
    /// into or read from.
    pub import_color_buffer: fn(&Dmabuf) -> Box<dyn DriverColorBuffer>,
    /// Allocates a driver color buffer directly, bypassing GBM; `sysmem`
    /// forces a system-memory (non-tiled) allocation. Used only by drivers
    /// that prefer to own allocation themselves; this crate's GBM-backed
    /// pool does not call this in the common path.
    pub allocate_color_buffer:
        fn(width: u32, height: u32, format: drm_fourcc::DrmFourcc, sysmem: bool) -> Box<dyn DriverColorBuffer>,
    /// Exports a driver color buffer as a dma-buf, so it can be wrapped in
    /// a shared pixmap. `None` if the buffer cannot be exported.
    pub export_color_buffer: fn(&dyn DriverColorBuffer) -> Option<Dmabuf>,
    /// Releases a driver color buffer. Called exactly once, when the last
    /// reference to the wrapping [`ColorBuffer`](crate::backend::x11::buffer::ColorBuffer) is dropped.
    pub free_color_buffer: fn(Box<dyn DriverColorBuffer>),
    /// GPU-blits `src` into `dst`; used only in offload (PRIME) mode to copy
    /// the rendered back buffer into the linear intermediate before
    /// presenting. Returns `false` on failure.
    pub copy_color_buffer: fn(src: &dyn DriverColorBuffer, dst: &dyn DriverColorBuffer) -> bool,
    /// Tells the driver which buffers now back `window`'s front/back/
    /// intermediate slots, after initial creation or a reallocation (§4.5.2).
    /// `intermediate` is `None` outside offload mode.
    pub set_color_buffers: fn(
        window: &W,
        front: &dyn DriverColorBuffer,
        back: &dyn DriverColorBuffer,
        intermediate: Option<&dyn DriverColorBuffer>,
    ),
    /// The driver's own interface version, queried once at display-instance
    /// construction.
    pub query_version: fn() -> (u32, u32),
    /// Called when the Present event pump has drained pending events and
    /// the buffer pool may have transitioned; corresponds to the driver's
    /// window-update callback.
    pub on_update: fn(&W),
    /// Called immediately before rendering is expected to resume after
    /// damage; corresponds to the driver's window-damage callback.
    pub on_damage: fn(&W),
    /// Produces a native-fence sync fd for the rendering already submitted
    /// against the current back buffer, for attaching to the explicit-sync
    /// timeline at swap time. `None` if the driver has no fence to give
    /// (e.g. nothing was rendered since the last swap, or the driver
    /// doesn't support native fences), in which case the timeline point is
    /// signalled immediately instead.
    pub create_rendering_fence: fn() -> Option<std::os::unix::io::OwnedFd>,
    /// Blocks the calling thread until all rendering submitted against the
    /// current back buffer has completed on the GPU (a `glFinish`-equivalent
    /// stall). Invoked once per swap under the `Finish` sync regime, and as
    /// the fallback for a window that was selected for `Implicit` sync at
    /// creation but whose process-wide import-sync-file support has since
    /// been disabled (§4.5.1, S4).
    pub finish_rendering: fn(),
}

impl<W> Clone for DriverCallbacks<W> {
    fn clone(&self) -> Self {
        DriverCallbacks {
            import_color_buffer: self.import_color_buffer,
            allocate_color_buffer: self.allocate_color_buffer,
            export_color_buffer: self.export_color_buffer,
            free_color_buffer: self.free_color_buffer,
            copy_color_buffer: self.copy_color_buffer,
            set_color_buffers: self.set_color_buffers,
            query_version: self.query_version,
            on_update: self.on_update,
            on_damage: self.on_damage,
            create_rendering_fence: self.create_rendering_fence,
            finish_rendering: self.finish_rendering,
        }
    }
}

impl<W> fmt::Debug for DriverCallbacks<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverCallbacks").finish_non_exhaustive()
    }
}

/// A handle to driver-side top-level display bookkeeping. Opaque: this
/// crate never enumerates or mutates the display's surface list, it only
/// reports back through [`report_error`].
pub trait DisplayHandle: fmt::Debug {}

/// Driver-owned registry of surfaces for a display; out of scope for this
/// crate beyond the handle it is given at window-creation time.
pub trait SurfaceRegistry: fmt::Debug {}

/// Reports an error through the driver's error channel. The driver owns the
/// actual formatting/logging sink; this crate only classifies the error.
pub fn report_error(display: &dyn DisplayHandle, err: &AdapterError) {
    tracing::error!(display = ?display, error = %err, "reported to driver error channel");
}
