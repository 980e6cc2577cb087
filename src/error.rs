//! Error kinds surfaced through the driver's error channel.
//!
//! Each subsystem defines its own error enum; [`AdapterError`] is the
//! top-level sum type every public entry point returns, with `From` impls
//! converging each subsystem error into it.

use std::io;

use crate::backend::allocator::gbm::GbmConvertError;
use crate::backend::drm::CreateDrmNodeError;

/// The ten error kinds the driver's error channel distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// An `EGLConfig` could not be resolved against this window/pixmap.
    #[error("invalid config")]
    InvalidConfig,

    /// The native window handle passed in is not a usable X window.
    #[error("invalid native window")]
    InvalidNativeWindow,

    /// The native pixmap handle passed in is not usable.
    #[error("invalid native pixmap")]
    InvalidNativePixmap,

    /// An attribute list contained an unsupported or malformed entry.
    #[error("invalid attribute")]
    InvalidAttribute,

    /// An operation was attempted on a display that was never initialized
    /// (or has already been terminated).
    #[error("not initialized")]
    NotInitialized,

    /// The surface is not in a state that allows the requested operation.
    #[error("bad surface: {0}")]
    BadSurface(#[source] SwapError),

    /// The surface or display does not support the combination of
    /// arguments given.
    #[error("bad match")]
    BadMatch,

    /// The caller does not have permission to perform the requested
    /// operation.
    #[error("bad access")]
    BadAccess,

    /// A kernel, GBM, or X allocation failed.
    #[error("allocation failure: {0}")]
    AllocFailure(#[source] PoolError),

    /// An unrecoverable internal error; the process should treat the
    /// display as unusable.
    #[error("critical internal error: {0}")]
    Critical(String),
}

impl From<FormatError> for AdapterError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::NoCommonModifier => AdapterError::BadMatch,
            FormatError::QueryFailed(msg) => AdapterError::Critical(msg),
        }
    }
}

impl From<TimelineError> for AdapterError {
    fn from(err: TimelineError) -> Self {
        AdapterError::AllocFailure(PoolError::Timeline(err))
    }
}

impl From<PoolError> for AdapterError {
    fn from(err: PoolError) -> Self {
        AdapterError::AllocFailure(err)
    }
}

impl From<PresentError> for AdapterError {
    fn from(err: PresentError) -> Self {
        AdapterError::BadSurface(SwapError::Present(err))
    }
}

impl From<SwapError> for AdapterError {
    fn from(err: SwapError) -> Self {
        match err {
            // §7/§9: native window destruction is fatal to the window, not
            // the process; subsequent swaps report it as an invalid native
            // window rather than the generic bad-surface catch-all.
            SwapError::WindowDestroyed => AdapterError::InvalidNativeWindow,
            other => AdapterError::BadSurface(other),
        }
    }
}

/// Errors from the format & modifier catalog.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The driver and server share no renderable modifier, and the client
    /// is not permitted to offload (PRIME) rendering.
    #[error("no matching format modifiers for window, and offload is not permitted")]
    NoCommonModifier,

    /// Querying the server's per-window or per-screen supported modifiers
    /// failed.
    #[error("failed to query supported modifiers: {0}")]
    QueryFailed(String),
}

/// Errors from the timeline sync object.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    /// The kernel refused to create or transfer a syncobj.
    #[error("syncobj allocation failed: {0}")]
    AllocFailure(io::Error),

    /// No fence file descriptor could be produced for the current point.
    #[error("failed to export a sync file for the current timeline point")]
    SyncFailure,
}

/// Errors from the color-buffer pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A timeline operation failed while waiting for or signaling a
    /// buffer's release point.
    #[error(transparent)]
    Timeline(#[from] TimelineError),

    /// The kernel allocator (GBM) failed to allocate or import a buffer.
    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] GbmConvertError),

    /// Opening the render-node device used for allocation failed.
    #[error("failed to open render node: {0}")]
    OpenDevice(#[from] io::Error),

    /// The device used for allocation is not a usable DRM render node.
    #[error("device is not a usable DRM node")]
    UnsupportedDrmNode,

    /// The native window was destroyed while waiting for a free buffer.
    #[error("native window destroyed while waiting for a free buffer")]
    WindowDestroyed,
}

impl From<CreateDrmNodeError> for PoolError {
    fn from(err: CreateDrmNodeError) -> Self {
        match err {
            CreateDrmNodeError::Io(err) => PoolError::OpenDevice(err),
            CreateDrmNodeError::NotDrmNode => PoolError::UnsupportedDrmNode,
        }
    }
}

/// Errors from the Present event pump and pixmap presentation.
#[derive(Debug, thiserror::Error)]
pub enum PresentError {
    /// A shared pixmap could not be created because the color buffer has
    /// more planes than the negotiated DRI3 version supports.
    #[error("color buffer has too many planes for the negotiated DRI3 version")]
    TooManyPlanes,

    /// Duplicating a file descriptor before handing it to an X request
    /// failed.
    #[error("failed to duplicate file descriptor: {0}")]
    DupFailed(String),

    /// The color buffer's format does not match the window's negotiated
    /// format.
    #[error("color buffer format does not match window format")]
    IncorrectFormat,

    /// The X connection returned a protocol error.
    #[error("X protocol error: {0}")]
    Protocol(String),
}

/// Errors from connecting to the X server and negotiating the DRI3/Present
/// extensions a display instance depends on.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Connecting to the X server failed.
    #[error("connecting to the X server failed: {0}")]
    ConnectionFailed(String),

    /// The server does not advertise a required extension at all.
    #[error("extension \"{name}\" version {major}.{minor} was not found")]
    ExtensionNotFound {
        /// Name of the required extension.
        name: &'static str,
        /// Minimum required major version.
        major: u32,
        /// Minimum required minor version.
        minor: u32,
    },

    /// The server advertises the extension, but at too low a version.
    #[error(
        "extension \"{name}\" version {required_major}.{required_minor} is required \
         but only {available_major}.{available_minor} is available"
    )]
    ExtensionTooOld {
        /// Name of the extension.
        name: &'static str,
        /// Minimum required major version.
        required_major: u32,
        /// Minimum required minor version.
        required_minor: u32,
        /// Major version actually advertised by the server.
        available_major: u32,
        /// Minor version actually advertised by the server.
        available_minor: u32,
    },

    /// A protocol error occurred during setup.
    #[error("protocol error during setup: {0}")]
    Protocol(String),
}

impl From<SetupError> for AdapterError {
    fn from(err: SetupError) -> Self {
        AdapterError::Critical(err.to_string())
    }
}

/// Errors from the swap-chain state machine.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// The native window has been destroyed.
    #[error("native window has been destroyed")]
    WindowDestroyed,

    /// The surface has already been marked deleted by a concurrent
    /// destroy-surface call.
    #[error("surface has been destroyed")]
    SurfaceDeleted,

    /// Presenting the frame failed.
    #[error(transparent)]
    Present(#[from] PresentError),

    /// Reallocating the buffer pool for a resize or modifier change
    /// failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Re-negotiating the format/modifier set during a reallocation failed.
    #[error(transparent)]
    Format(#[from] FormatError),
}
