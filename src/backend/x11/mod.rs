//! DRI3/Present window-system-integration adapter (§1, §6).
//!
//! [`DisplayInstance`] connects to an X server, negotiates the DRI3/Present
//! extensions and opens the render node a host GPU driver's windows will
//! share, and hands out per-window [`WindowSurface`]s via
//! [`DisplayInstance::create_surface`].
//!
//! A note for future contributors and maintainers:
//!
//! DRI3 protocol documentation: <https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/dri3proto.txt>
//!
//! Present protocol documentation: <https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/presentproto.txt>

mod buffer;
mod callbacks;
mod event_pump;
#[cfg(feature = "event_source")]
mod event_source;
#[macro_use]
mod extension;
mod format;
mod pool;
mod state;
mod surface;
mod swapchain;
mod sync;
mod timeline;

use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex};

use drm::Device as _;
use drm_fourcc::DrmModifier as Modifier;
use gbm::{BufferObjectFlags as GbmBufferFlags, Device as GbmDevice};
use rustix::fs::{Mode, OFlags};
use tracing::{debug_span, info, instrument, warn};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::present::ConnectionExt as _;
use x11rb::rust_connection::{ReplyError, RustConnection};
use x11rb::ErrorKind;

use crate::backend::allocator::gbm::GbmAllocator;
use crate::backend::drm::{DrmNode, NodeType, RenderDevice};
use crate::config::Config;
use crate::error::{AdapterError, SetupError};
use crate::external::{DriverCallbacks, FormatInfo, NativeWindowHandle};
use crate::utils::fd::DeviceFd;

pub use self::event_pump::EventPump;
#[cfg(feature = "event_source")]
pub use self::event_source::X11Source;
pub use self::surface::WindowSurface;

use self::extension::Extensions;
use self::sync::SyncCapabilities;

/// Present's syncobj-capability bit in `PresentCapabilities`
/// (`PresentCapabilitySyncobj` in presentproto.txt), reported per window by
/// `PresentQueryCapabilities` once the server negotiates Present ≥ 1.4.
const CAP_SYNCOBJ: u32 = 1 << 4;

/// One connection to an X server, negotiated against the DRI3/Present
/// extensions this adapter depends on (§6), with the render node and GBM
/// allocator every window created against it shares.
#[derive(Debug)]
pub struct DisplayInstance {
    connection: Arc<RustConnection>,
    screen_number: usize,
    extensions: Extensions,
    config: Config,
    device: Arc<RenderDevice>,
    drm_node: DrmNode,
    allocator: Arc<Mutex<GbmAllocator<RenderDevice>>>,
    events: Arc<EventPump>,
    span: tracing::Span,
}

impl DisplayInstance {
    /// Connects to `dpy_name` (or the default display if `None`, which
    /// falls back to the `DISPLAY` environment variable per Xlib/XCB
    /// convention), checks the DRI3/Present extension versions (Non-goal:
    /// servers below DRI3 1.2 / Present 1.2 are not supported), and opens
    /// the render node buffers will be allocated from.
    #[instrument(skip(dpy_name))]
    pub fn new(dpy_name: Option<&str>) -> Result<Self, SetupError> {
        let span = debug_span!("x11_platform_adapter");
        let _guard = span.enter();

        let (connection, screen_number) =
            RustConnection::connect(dpy_name).map_err(|err| SetupError::ConnectionFailed(err.to_string()))?;
        let connection = Arc::new(connection);
        info!(screen = screen_number, "connected to X server");

        let extensions = Extensions::check_extensions(&*connection)?;
        let config = Config::from_env();

        let (drm_node, device_fd) = open_render_node(&connection, screen_number, &config)?;
        let device = Arc::new(RenderDevice::new(DeviceFd::from(device_fd)));

        let gbm_device =
            GbmDevice::new((*device).clone()).map_err(|err| SetupError::Protocol(err.to_string()))?;
        let allocator = Arc::new(Mutex::new(GbmAllocator::new(gbm_device, GbmBufferFlags::RENDERING)));

        let events = Arc::new(EventPump::new(connection.clone()));

        drop(_guard);
        Ok(DisplayInstance {
            connection,
            screen_number,
            extensions,
            config,
            device,
            drm_node,
            allocator,
            events,
            span,
        })
    }

    /// The default screen number of the X server this instance connected to.
    pub fn screen(&self) -> usize {
        self.screen_number
    }

    /// The underlying connection, shared by every surface created against
    /// this instance.
    pub fn connection(&self) -> &Arc<RustConnection> {
        &self.connection
    }

    /// Configuration read from the environment at construction time.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The render node buffers are allocated from.
    pub fn drm_node(&self) -> DrmNode {
        self.drm_node
    }

    /// The event pump every surface created against this instance shares.
    pub fn events(&self) -> &Arc<EventPump> {
        &self.events
    }

    /// Creates a presentable surface for `window`, negotiating its format,
    /// modifiers, and synchronization regime.
    ///
    /// `driver_native_fence` is whether the driver's `EGLConfig`/context
    /// layer (out of scope here) can produce a native-fence-sync for its
    /// own rendering; it gates the explicit-sync regime alongside the
    /// kernel/server capabilities this instance queries itself.
    ///
    /// `allow_offload` is the caller's request to permit the PRIME path for
    /// this window; it only actually takes effect when
    /// `__NV_PRIME_RENDER_OFFLOAD` is also set, matching the environment
    /// variable's documented meaning rather than letting a caller unilaterally
    /// force cross-GPU rendering.
    #[allow(clippy::too_many_arguments)]
    #[instrument(parent = &self.span, skip(self, window, callbacks, driver_window))]
    pub fn create_surface<W>(
        &self,
        window: &dyn NativeWindowHandle,
        format: FormatInfo,
        driver_modifiers: &[Modifier],
        driver_native_fence: bool,
        allow_offload: bool,
        flags: GbmBufferFlags,
        callbacks: Option<DriverCallbacks<W>>,
        driver_window: Option<W>,
    ) -> Result<WindowSurface<W>, AdapterError> {
        let xid = window.xid();
        let allow_offload = allow_offload && self.config.prime_render_offload;

        let present_capabilities = self
            .connection
            .present_query_capabilities(xid)
            .map_err(|err| AdapterError::Critical(err.to_string()))?
            .reply()
            .map_err(|err| AdapterError::Critical(err.to_string()))?
            .capabilities;

        let sync_caps = SyncCapabilities {
            driver_native_fence,
            kernel_timeline_syncobj: self.supports_timeline_syncobj(),
            server_syncobj_present: self.extensions.supports_syncobj() && self.extensions.supports_pixmap_synced(),
            window_syncobj_capability: present_capabilities & CAP_SYNCOBJ != 0,
            kernel_import_sync_file: sync::import_sync_file_available(),
            implicit_sync_unsafe_on_server: !self.config.force_enable && self.is_implicit_sync_unsafe_server(),
        };

        WindowSurface::new(
            window,
            self.events.clone(),
            self.device.clone(),
            self.allocator.clone(),
            format,
            driver_modifiers,
            allow_offload,
            sync_caps,
            present_capabilities,
            self.extensions.supports_multiplane(),
            flags,
            callbacks,
            driver_window,
        )
    }

    /// `DRM_CAP_SYNCOBJ_TIMELINE` for this instance's render node.
    fn supports_timeline_syncobj(&self) -> bool {
        self.device
            .get_driver_capability(drm::DriverCapability::TimelineSyncObj)
            .map(|cap| cap != 0)
            .unwrap_or(false)
    }

    /// Whether the server's GPU driver is one whose own synchronization is
    /// invisible to implicit sync (historically: NVIDIA), per §4.5.1.
    fn is_implicit_sync_unsafe_server(&self) -> bool {
        match self.device.get_driver() {
            Ok(driver) => {
                let name = driver.name().to_string_lossy().to_lowercase();
                name.contains("nvidia")
            }
            Err(err) => {
                warn!(error = %err, "failed to query render node driver name, assuming implicit sync is safe");
                false
            }
        }
    }
}

/// Opens the render node buffers are allocated from: the path forced by
/// `__NV_PRIME_RENDER_OFFLOAD_PROVIDER` if set, otherwise the device the X
/// server's DRI3 `Open` request hands back.
///
/// Kernel documentation recommends render nodes for non-modesetting
/// clients (only non-global rendering commands are allowed on them); if
/// the node DRI3 hands back is the primary node, a render node sibling is
/// opened instead when one exists, falling back to the primary node
/// otherwise.
fn open_render_node(
    connection: &RustConnection,
    screen_number: usize,
    config: &Config,
) -> Result<(DrmNode, OwnedFd), SetupError> {
    if let Some(path) = &config.prime_render_offload_provider {
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|err| SetupError::ConnectionFailed(err.to_string()))?;
        let node =
            DrmNode::from_file(&fd).map_err(|err| SetupError::ConnectionFailed(err.to_string()))?;
        info!(?path, "using forced PRIME render offload provider");
        return Ok((node, fd));
    }

    let screen = &connection.setup().roots[screen_number];
    let reply = match connection
        .dri3_open(screen.root, x11rb::NONE)
        .map_err(|err| SetupError::Protocol(err.to_string()))?
        .reply()
    {
        Ok(reply) => reply,
        Err(ReplyError::X11Error(ref protocol_error))
            if matches!(protocol_error.error_kind, ErrorKind::Implementation | ErrorKind::Match) =>
        {
            return Err(SetupError::Protocol(
                "server cannot hand back a direct-rendering device for this screen".to_string(),
            ));
        }
        Err(err) => return Err(SetupError::Protocol(err.to_string())),
    };

    let device_fd = reply.device_fd;
    let node = DrmNode::from_file(&device_fd).map_err(|err| SetupError::Protocol(err.to_string()))?;

    if node.ty() != NodeType::Render {
        if let Some(path) = node.dev_path_with_type(NodeType::Render) {
            match rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => {
                    if let Ok(render_node) = DrmNode::from_file(&fd) {
                        return Ok((render_node, fd));
                    }
                }
                Err(err) => {
                    warn!(error = %err, ?path, "failed to open render node, falling back to primary node");
                }
            }
        } else {
            warn!(?node, "no render node available for this device, falling back to primary node");
        }
    }

    let fd_flags = rustix::io::fcntl_getfd(&device_fd).map_err(|err| SetupError::Protocol(err.to_string()))?;
    rustix::io::fcntl_setfd(&device_fd, fd_flags | rustix::io::FdFlags::CLOEXEC)
        .map_err(|err| SetupError::Protocol(err.to_string()))?;

    Ok((node, device_fd))
}
