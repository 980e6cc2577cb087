//! The three end-of-rendering synchronization regimes (§4.5.1, §9): chosen
//! once per window at creation time and immutable afterward, so the per-swap
//! dispatch is a single match rather than a set of capability checks.

use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::ioctl::{ioctl, Setter, WriteOpcode};

/// How a window synchronizes the end of driver rendering with the X server
/// before a buffer is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sync {
    /// Driver exposes native-fence-sync, the kernel supports DRM timeline
    /// syncobjs, and both the server and the window report the syncobj
    /// Present capability. A native fence is attached to the buffer's
    /// timeline as its next release point; the present request carries
    /// acquire/release points on that timeline.
    Explicit,
    /// The kernel supports `DMA_BUF_IOCTL_IMPORT_SYNC_FILE` and the server
    /// is not running on a driver whose own sync is invisible to it (see
    /// [`nvidia_implicit_sync_unsafe`]). A native fence is plugged directly
    /// into the presented buffer's dma-buf.
    Implicit,
    /// Neither of the above: a CPU stall (driver-side `glFinish`-equivalent)
    /// before every present. Correct, but stalls the caller.
    Finish,
}

/// Inputs to regime selection, gathered once at window-creation time.
#[derive(Debug, Clone, Copy)]
pub struct SyncCapabilities {
    /// Driver exposes a native-fence-sync (Android `EGL_ANDROID_native_fence_sync`-equivalent) extension.
    pub driver_native_fence: bool,
    /// `DRM_CAP_SYNCOBJ_TIMELINE` reported true for the render node.
    pub kernel_timeline_syncobj: bool,
    /// The server negotiated DRI3 ≥ 1.4 and Present ≥ 1.4 (syncobj Present).
    pub server_syncobj_present: bool,
    /// The window itself reports the syncobj Present capability bit.
    pub window_syncobj_capability: bool,
    /// The kernel's dma-buf import-sync-file ioctl has not (yet) failed
    /// process-wide; see [`ImportSyncFileProbe`].
    pub kernel_import_sync_file: bool,
    /// The server is a driver whose own GPU synchronization is invisible to
    /// implicit sync (historically: NVIDIA), making the implicit regime
    /// unsafe to use against it.
    pub implicit_sync_unsafe_on_server: bool,
}

impl Sync {
    /// Picks a regime from the gathered capabilities, preferring explicit,
    /// then implicit, falling back to the CPU finish.
    pub fn select(caps: SyncCapabilities) -> Sync {
        if caps.driver_native_fence
            && caps.kernel_timeline_syncobj
            && caps.server_syncobj_present
            && caps.window_syncobj_capability
        {
            Sync::Explicit
        } else if caps.kernel_import_sync_file && !caps.implicit_sync_unsafe_on_server {
            Sync::Implicit
        } else {
            Sync::Finish
        }
    }
}

/// The process-wide sticky flag from §4.5.1: "a once-probed flag disables
/// the import-sync-file path process-wide after the first
/// `ENOTTY`/`EBADF`/`ENOSYS`". Transient failures of that one ioctl degrade
/// every window's implicit-sync regime silently, for the rest of the
/// process, rather than per-window.
static IMPORT_SYNC_FILE_DISABLED: AtomicBool = AtomicBool::new(false);

/// Whether `DMA_BUF_IOCTL_IMPORT_SYNC_FILE` is still believed to work on
/// this system.
pub fn import_sync_file_available() -> bool {
    !IMPORT_SYNC_FILE_DISABLED.load(Ordering::Relaxed)
}

/// Errno values that permanently disable the import-sync-file path for the
/// rest of the process, per §4.5.1.
pub fn is_import_sync_file_disabling_error(err: &rustix::io::Errno) -> bool {
    matches!(*err, rustix::io::Errno::NOTTY | rustix::io::Errno::BADF | rustix::io::Errno::NOSYS)
}

/// Records that `DMA_BUF_IOCTL_IMPORT_SYNC_FILE` failed with a disqualifying
/// errno. Idempotent: later callers observing the same failure are no-ops.
pub fn disable_import_sync_file() {
    if !IMPORT_SYNC_FILE_DISABLED.swap(true, Ordering::Relaxed) {
        tracing::warn!("dma-buf import-sync-file unsupported; falling back to finish-sync for the rest of the process");
    }
}

/// `struct dma_buf_import_sync_file` from `linux/dma-buf.h`: the ioctl
/// argument that plugs an externally-produced sync file into a dma-buf's
/// implicit fence.
#[repr(C)]
struct DmaBufImportSyncFile {
    flags: u32,
    fd: i32,
}

/// `DMA_BUF_SYNC_WRITE` from `linux/dma-buf.h`: the buffer is about to be
/// read by the consumer (the X server's scanout/compositing), so the
/// imported fence is attached as a write-side fence.
const DMA_BUF_SYNC_WRITE: u32 = 2;

/// `DMA_BUF_BASE` ioctl group (`'b'`) and `DMA_BUF_IOCTL_IMPORT_SYNC_FILE`'s
/// request number (3), from `linux/dma-buf.h`. The ioctl is `_IOW`: the
/// kernel only reads `DmaBufImportSyncFile`, never writes anything back.
type ImportSyncFileOpcode = WriteOpcode<b'b', 3, DmaBufImportSyncFile>;

/// Implicit-sync regime (§4.5.1): plugs `fence`, the driver's native-fence
/// sync for the rendering that targeted `dmabuf_fd`, into that dma-buf's
/// implicit fence via `DMA_BUF_IOCTL_IMPORT_SYNC_FILE`, so anything that
/// later maps the buffer through the kernel's implicit-sync machinery (the
/// X server's scanout) waits on it without this process attaching an
/// explicit acquire point anywhere.
///
/// Returns the ioctl's raw error on failure; the caller checks
/// [`is_import_sync_file_disabling_error`] against it to decide whether to
/// call [`disable_import_sync_file`].
pub fn import_sync_file(dmabuf_fd: BorrowedFd<'_>, fence: OwnedFd) -> rustix::io::Result<()> {
    let arg = DmaBufImportSyncFile {
        flags: DMA_BUF_SYNC_WRITE,
        fd: fence.as_raw_fd(),
    };
    let ctl = Setter::<ImportSyncFileOpcode, DmaBufImportSyncFile>::new(arg);
    unsafe { ioctl(dmabuf_fd, ctl) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(explicit: bool, implicit: bool) -> SyncCapabilities {
        SyncCapabilities {
            driver_native_fence: explicit,
            kernel_timeline_syncobj: explicit,
            server_syncobj_present: explicit,
            window_syncobj_capability: explicit,
            kernel_import_sync_file: implicit,
            implicit_sync_unsafe_on_server: false,
        }
    }

    #[test]
    fn prefers_explicit_when_fully_available() {
        assert_eq!(Sync::select(caps(true, true)), Sync::Explicit);
    }

    #[test]
    fn falls_back_to_implicit_without_explicit_support() {
        assert_eq!(Sync::select(caps(false, true)), Sync::Implicit);
    }

    #[test]
    fn falls_back_to_finish_with_neither() {
        assert_eq!(Sync::select(caps(false, false)), Sync::Finish);
    }

    #[test]
    fn nvidia_server_disqualifies_implicit_even_if_kernel_supports_it() {
        let mut c = caps(false, true);
        c.implicit_sync_unsafe_on_server = true;
        assert_eq!(Sync::select(c), Sync::Finish);
    }

    #[test]
    fn import_sync_file_disable_is_sticky() {
        // This flag is process-global; only assert the disabling direction
        // here since a prior test in this binary may have already flipped
        // it and AtomicBool has no reset.
        disable_import_sync_file();
        assert!(!import_sync_file_available());
    }
}
