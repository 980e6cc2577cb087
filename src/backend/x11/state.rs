//! Per-window state (§3, §5): the X window id, its current/pending
//! geometry, the negotiated format and sync regime, its buffer pools, and
//! the bookkeeping the swap-chain and event pump share.
//!
//! The mutex here stands in for the "recursive mutex" §5 calls for: a
//! driver callback re-entering the adapter while the window lock is already
//! held by the same thread (e.g. `update_callback_hook` firing from inside
//! `swap_buffers`) must not deadlock. `std::sync::Mutex` is not recursive,
//! so re-entrancy is tracked with a separate atomic counter instead: the
//! thread that already holds the lock increments it and skips re-locking,
//! rather than the mutex itself being made recursive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use gbm::BufferObjectFlags as GbmBufferFlags;
use x11rb::connection::Connection as _;
use x11rb::protocol::present::{ConnectionExt as _, EventMask};
use x11rb::protocol::xproto::Window as Xid;
use x11rb::rust_connection::RustConnection;

use crate::backend::allocator::gbm::GbmAllocator;
use crate::backend::drm::RenderDevice;
use crate::error::SetupError;

use super::event_pump::EventPump;
use super::pool::{ColorBufferPool, DIRECT_CAP, INTERMEDIATE_CAP};
use super::sync::Sync;

/// The two buffer pools a window may hold: the direct-presentable pool
/// always exists; the linear intermediate only exists once the window has
/// negotiated offload (PRIME) mode.
#[derive(Debug)]
pub struct PoolPair {
    /// Buffers the server can scan out or blit directly from.
    pub direct: ColorBufferPool,
    /// Linear render target used only in offload mode, GPU-blit into a
    /// `direct` buffer before presenting.
    pub intermediate: Option<ColorBufferPool>,
}

/// Mutable window state guarded by [`WindowState`]'s mutex.
#[derive(Debug)]
pub struct Inner {
    /// Width/height currently in effect for allocation.
    pub width: u32,
    pub height: u32,
    /// New geometry reported by a `ConfigureNotify` not yet applied to the
    /// pools (applied lazily, at the next swap, per §4.5.2).
    pub pending_resize: Option<(u32, u32)>,
    /// Set once a `ConfigureNotify` reports the window has been destroyed.
    /// Sticky: once true, every subsequent operation on this window fails.
    pub native_destroyed: bool,
    /// Set when the negotiated modifier may no longer be valid (e.g. after
    /// a `CompleteNotify` reports `suboptimal`) and should be re-queried
    /// before the next allocation.
    pub needs_modifier_check: bool,
    /// Sticky: once the window has had to offload once, it stays in
    /// offload mode rather than flapping between direct and offload on
    /// every modifier re-check.
    pub force_prime: bool,
    pub format: Fourcc,
    pub modifier: Modifier,
    pub pools: PoolPair,
    pub sync: Sync,
    /// Raw `PresentCapabilities` bitmask, as reported by
    /// `PresentQueryCapabilities` (kept raw rather than decoded into bools:
    /// callers care about specific bits at different points).
    pub present_capabilities: u32,
    /// `0` means present as fast as possible (subject to capability
    /// downgrade); otherwise the number of vblanks between presents.
    pub swap_interval: i32,
    pub last_sent_serial: u32,
    pub last_completed_serial: u32,
    pub last_completed_msc: u64,
    /// Number of in-flight update callbacks that should suppress the
    /// damage callback hook (a counter, not a bool: nested resizes can
    /// each request suppression independently).
    pub skip_update_callback: u32,
}

/// Per-window state shared between the public surface, the swap-chain
/// state machine, and the driver callback hooks.
#[derive(Debug)]
pub struct WindowState {
    pub window: Xid,
    pub connection: Arc<RustConnection>,
    pub events: Arc<EventPump>,
    pub depth: u8,
    pub bpp: u8,
    pub dri3_supports_multiplane: bool,
    /// The driver's renderable modifier list for this format, fixed at
    /// construction; a modifier re-check (§4.5.2) re-intersects this same
    /// list against the server rather than asking the driver again.
    pub driver_modifiers: Vec<Modifier>,
    /// Whether this window is permitted to fall back to offload (PRIME)
    /// mode if no common direct modifier is found on a re-check.
    pub allow_offload: bool,
    inner: Mutex<Inner>,
    reentrancy: AtomicU32,
}

impl WindowState {
    /// Creates window state and registers this window's Present event
    /// stream with the server, including the `ConfigureNotify` bit the
    /// destroyed-window and resize detection in §4.4/§9 depend on.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<RustConnection>,
        events: Arc<EventPump>,
        window: Xid,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
        allocator: Arc<Mutex<GbmAllocator<RenderDevice>>>,
        flags: GbmBufferFlags,
        sync: Sync,
        present_capabilities: u32,
        depth: u8,
        bpp: u8,
        dri3_supports_multiplane: bool,
        driver_modifiers: Vec<Modifier>,
        allow_offload: bool,
        requires_offload: bool,
    ) -> Result<Arc<Self>, SetupError> {
        present_select_input(&connection, window)?;
        events.register(window);

        let direct = ColorBufferPool::new(allocator.clone(), DIRECT_CAP, width, height, format, modifier, flags);
        let intermediate = requires_offload
            .then(|| ColorBufferPool::new(allocator, INTERMEDIATE_CAP, width, height, format, Modifier::Linear, flags));

        let inner = Inner {
            width,
            height,
            pending_resize: None,
            native_destroyed: false,
            needs_modifier_check: false,
            force_prime: requires_offload,
            format,
            modifier,
            pools: PoolPair { direct, intermediate },
            sync,
            present_capabilities,
            swap_interval: 1,
            last_sent_serial: 0,
            last_completed_serial: 0,
            last_completed_msc: 0,
            skip_update_callback: 0,
        };

        Ok(Arc::new(WindowState {
            window,
            connection,
            events,
            depth,
            bpp,
            dri3_supports_multiplane,
            driver_modifiers,
            allow_offload,
            inner: Mutex::new(inner),
            reentrancy: AtomicU32::new(0),
        }))
    }

    /// Locks the window state for the duration of the closure. Re-entrant
    /// for the same thread (see module docs): a nested call observes the
    /// counter already non-zero and is expected to use
    /// [`Self::reentrant_lock`] instead of calling this again, which would
    /// deadlock against `std::sync::Mutex`.
    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Whether the calling thread is already inside a
    /// [`Self::with_reentrant_guard`] scope for this window.
    pub fn is_reentrant(&self) -> bool {
        self.reentrancy.load(Ordering::Acquire) > 0
    }

    /// Marks entry into a scope from which a driver callback may re-enter
    /// this window (e.g. before invoking `update_callback_hook`), and
    /// clears it on drop.
    pub fn enter_callback_scope(&self) -> CallbackScopeGuard<'_> {
        self.reentrancy.fetch_add(1, Ordering::AcqRel);
        CallbackScopeGuard { state: self }
    }

    pub fn unregister(&self) {
        self.events.unregister(self.window);
    }
}

/// Drops the re-entrancy counter on scope exit.
pub struct CallbackScopeGuard<'a> {
    state: &'a WindowState,
}

impl Drop for CallbackScopeGuard<'_> {
    fn drop(&mut self) {
        self.state.reentrancy.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registers interest in the three Present sub-events the swap-chain and
/// destroyed-window detection need. Earlier revisions of this adapter only
/// requested `COMPLETE_NOTIFY | IDLE_NOTIFY`; `CONFIGURE_NOTIFY` is required
/// too; without it a destroyed or resized window is never detected.
fn present_select_input(connection: &RustConnection, window: Xid) -> Result<(), SetupError> {
    let eid = connection
        .generate_id()
        .map_err(|err| SetupError::Protocol(err.to_string()))?;
    connection
        .present_select_input(
            eid,
            window,
            EventMask::CONFIGURE_NOTIFY | EventMask::COMPLETE_NOTIFY | EventMask::IDLE_NOTIFY,
        )
        .map_err(|err| SetupError::Protocol(err.to_string()))?;
    Ok(())
}
