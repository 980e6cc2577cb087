//! The swap-chain state machine (§4.5): turns a rendered buffer into a
//! `PresentPixmap`/`PresentPixmapSynced` request, choosing a free buffer,
//! a synchronization strategy, and a target MSC.

use std::time::Duration;

use drm_fourcc::DrmModifier as Modifier;
use x11rb::connection::Connection as _;
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::xproto::Window as Xid;
use x11rb::rust_connection::RustConnection;

use crate::error::SwapError;
use crate::utils::serial::Serial;

use super::buffer::BufferStatus;
use super::event_pump::Effect;
use super::pool::ColorBufferPool;
use super::state::{Inner, WindowState};
use super::sync::Sync;

/// Which of a window's two pools an operation applies to: the direct pool
/// always exists, the intermediate only in offload (PRIME) mode (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Direct,
    Intermediate,
}

pub fn pool_mut(inner: &mut Inner, kind: PoolKind) -> &mut ColorBufferPool {
    match kind {
        PoolKind::Direct => &mut inner.pools.direct,
        PoolKind::Intermediate => inner
            .pools
            .intermediate
            .as_mut()
            .expect("intermediate pool requested on a window that never negotiated offload"),
    }
}

/// Present's async-capability bit in `PresentCapabilities` (allows
/// presenting without waiting for `target_msc`, tearing if the frame lands
/// mid-scanout).
const CAP_ASYNC: u32 = 1 << 2;

/// How long a free-buffer wait blocks before re-checking `native_destroyed`
/// and retrying, per §9's requirement that every blocking wait also drains
/// events.
const FREE_BUFFER_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Drains whatever the event pump has for `window` (non-blocking) and
/// folds each event's effect into the window's bookkeeping.
pub fn pump_events(state: &WindowState) -> Result<(), SwapError> {
    let events = state
        .events
        .poll(state.window)
        .map_err(SwapError::Present)?;
    apply_effects(state, events.into_iter().map(Effect::from));
    Ok(())
}

/// §4.5 step 6: blocks until at most one present is outstanding
/// (`sent - completed <= 1`), per S5 ("the 5th blocks until either an event
/// arrives..."). Mirrors the original's `while(1)` loop around a blocking
/// wait for window events, re-checking `native_destroyed` every iteration
/// rather than a single non-blocking poll that lets outstanding presents
/// grow unbounded.
pub fn throttle_outstanding_presents(state: &WindowState) -> Result<(), SwapError> {
    loop {
        {
            let inner = state.lock();
            if inner.native_destroyed {
                return Err(SwapError::WindowDestroyed);
            }
            let pending = inner.last_sent_serial.wrapping_sub(inner.last_completed_serial);
            if pending <= 1 {
                return Ok(());
            }
        }
        let events = state
            .events
            .wait(state.window, FREE_BUFFER_POLL_TIMEOUT)
            .map_err(SwapError::Present)?;
        apply_effects(state, events.into_iter().map(Effect::from));
    }
}

fn apply_effects(state: &WindowState, effects: impl Iterator<Item = Effect>) {
    let mut inner = state.lock();
    for effect in effects {
        match effect {
            Effect::Resize {
                width,
                height,
                destroyed,
            } => {
                if destroyed {
                    inner.native_destroyed = true;
                } else {
                    inner.pending_resize = Some((width as u32, height as u32));
                }
            }
            Effect::ReleaseBuffer { pixmap, serial } => {
                // §4.4: ignored under explicit sync. A buffer presented with
                // an explicit release point only becomes IDLE once its
                // timeline signals that point (`wait_explicit`); trusting
                // `IdleNotify` here instead would hand the buffer back
                // before the GPU work it was presented with is actually
                // known to have finished.
                if inner.sync == Sync::Explicit {
                    continue;
                }
                // Only the implicit regime stages through `IdleNotified`
                // (it still has to confirm the dma-buf's fence via
                // `wait_implicit`'s `POLLOUT` poll); `Finish` has no such
                // fence to wait for; nothing ever promotes `IdleNotified`
                // back to `Idle` under that regime, so recycling straight
                // to `Idle` here is the only transition that exists for it.
                let status = match inner.sync {
                    Sync::Implicit => BufferStatus::IdleNotified,
                    Sync::Explicit | Sync::Finish => BufferStatus::Idle,
                };
                if let Some(idx) = inner.pools.direct.find_by_pixmap_and_serial(pixmap, serial) {
                    inner.pools.direct.recycle_to_tail(idx, status);
                } else if let Some(pool) = inner.pools.intermediate.as_mut() {
                    if let Some(idx) = pool.find_by_pixmap_and_serial(pixmap, serial) {
                        pool.recycle_to_tail(idx, status);
                    }
                }
            }
            Effect::Completed { serial, msc, suboptimal } => {
                // Wrap-aware "is newer": a serial strictly ahead of the one we
                // already hold, in unsigned-distance terms, replaces it.
                if Serial::from(serial) > Serial::from(inner.last_completed_serial) {
                    inner.last_completed_serial = serial;
                    inner.last_completed_msc = msc;
                }
                // SUBOPTIMAL_COPY is expected (and ignored) in offload mode:
                // the intermediate is always linear, so the server always
                // has to composite it; only a direct-mode window's
                // modifier selection is worth re-checking (§9 open question 2).
                if suboptimal && !inner.force_prime {
                    inner.needs_modifier_check = true;
                }
            }
        }
    }
}

/// §4.5.2's reallocation triggers: pending geometry differs from the pools'
/// current size, or the server has flagged the negotiated modifier as
/// suboptimal and it needs re-checking against the server's supported set.
pub fn needs_reallocation(inner: &Inner) -> bool {
    let resized = inner
        .pending_resize
        .map(|(width, height)| width != inner.width || height != inner.height)
        .unwrap_or(false);
    resized || inner.needs_modifier_check
}

/// The width/height a reallocation should target: the pending geometry if
/// one was reported, otherwise the pools' current size (a pure
/// modifier-recheck reallocation keeps the same geometry).
pub fn reallocation_target_size(inner: &Inner) -> (u32, u32) {
    inner.pending_resize.unwrap_or((inner.width, inner.height))
}

/// Whether the pending geometry alone (ignoring `needs_modifier_check`)
/// differs from what the pools are currently allocated at. This is the
/// trigger the update callback is allowed to act on (§4.6): a modifier
/// re-check is deferred to the next swap since it means an extra server
/// round-trip the driver-callback locking discipline forbids.
pub fn pending_resize_differs(inner: &Inner) -> bool {
    inner
        .pending_resize
        .map(|(width, height)| width != inner.width || height != inner.height)
        .unwrap_or(false)
}

/// Applies a reallocation decided by the caller: frees every pool buffer
/// (their `Drop` impls release dmabufs, timelines, and driver tokens) and
/// re-creates them lazily at `width`/`height`/`modifier` on next
/// acquisition, per §4.5.2 ("all pool buffers are freed and re-created at
/// the new size and modifier"). Does not touch `needs_modifier_check`:
/// callers that actually re-negotiated the modifier clear it themselves,
/// so a size-only reallocation (§4.6) leaves a pending re-check in place
/// for the next swap to act on.
pub fn reallocate_pools(connection: &RustConnection, inner: &mut Inner, width: u32, height: u32, modifier: Modifier) {
    inner.pools.direct.reallocate(connection, width, height, modifier);
    if let Some(pool) = inner.pools.intermediate.as_mut() {
        pool.reallocate(connection, width, height, Modifier::Linear);
    }
    inner.width = width;
    inner.height = height;
    inner.modifier = modifier;
    inner.pending_resize = None;
    tracing::debug!(width, height, modifier = ?modifier, "color buffer pools reallocated");
}

/// §4.5.2's full reallocation path, run from inside a swap: if a resize or
/// modifier re-check is pending, re-negotiates the modifier (only when the
/// re-check bit is set; a pure resize keeps the current modifier) and
/// reallocates both pools at the new size/modifier. Returns whether a
/// reallocation actually happened.
pub fn reallocate_if_needed(state: &WindowState) -> Result<bool, SwapError> {
    let (needs, modifier_check, current_modifier) = {
        let inner = state.lock();
        (needs_reallocation(&inner), inner.needs_modifier_check, inner.modifier)
    };
    if !needs {
        return Ok(false);
    }

    let modifier = if modifier_check {
        let negotiated = super::format::negotiate(
            &state.connection,
            state.window,
            state.depth,
            state.bpp,
            &state.driver_modifiers,
            state.allow_offload,
        )?;
        negotiated.modifiers.first().copied().unwrap_or(current_modifier)
    } else {
        current_modifier
    };

    let mut inner = state.lock();
    let (width, height) = reallocation_target_size(&inner);
    reallocate_pools(&state.connection, &mut inner, width, height, modifier);
    inner.needs_modifier_check = false;
    Ok(true)
}

/// §4.5's exact `target_msc` formula: present as soon as possible when the
/// window has no swap interval, otherwise space presents `swap_interval`
/// vblanks apart, accounting for however many presents are already
/// in flight.
pub fn target_msc(swap_interval: i32, last_sent_serial: u32, last_completed_serial: u32, last_completed_msc: u64) -> u64 {
    if swap_interval <= 0 {
        return 0;
    }
    let num_pending = last_sent_serial.wrapping_sub(last_completed_serial) as u64;
    last_completed_msc + (num_pending + 1) * swap_interval as u64
}

/// Downgrades a requested present to `PresentOptionAsync` only when the
/// window both asked for unthrottled presentation (`swap_interval <= 0`)
/// and the server actually advertises the capability; otherwise the
/// request must carry a real `target_msc` or the server will simply queue
/// every frame one vblank apart regardless of what we asked for.
fn present_options(swap_interval: i32, present_capabilities: u32) -> u32 {
    if swap_interval <= 0 && present_capabilities & CAP_ASYNC != 0 {
        present::Option::ASYNC.into()
    } else {
        present::Option::NONE.into()
    }
}

/// Waits for at least one buffer in `pool` to become idle, per the
/// window's sync regime, re-polling events every iteration so a
/// `ConfigureNotify` destroying the window is noticed promptly.
///
/// - `Explicit`: kernel syncobj timeline wait-available across every
///   non-idle buffer, 100 ms timeout; on signal, promote that buffer.
/// - `Implicit`: poll the dma-buf fds of buffers in `IdleNotified` for
///   `POLLOUT`, same timeout; if none has reached `IdleNotified` yet, fall
///   through to the event wait below and retry.
/// - `Finish`: no fd to wait on; rely purely on event packets.
pub fn wait_for_free_buffer(state: &WindowState, kind: PoolKind, exclude: Option<usize>) -> Result<usize, SwapError> {
    loop {
        pump_events(state)?;
        {
            let mut inner = state.lock();
            if inner.native_destroyed {
                return Err(SwapError::WindowDestroyed);
            }
            if let Some(idx) = pool_mut(&mut inner, kind)
                .acquire_idle(exclude)
                .map_err(|err| SwapError::Pool(err.into()))?
            {
                return Ok(idx);
            }

            let found = match inner.sync {
                Sync::Explicit => wait_explicit(&mut inner, kind, exclude)?,
                Sync::Implicit => wait_implicit(&mut inner, kind, exclude)?,
                Sync::Finish => None,
            };
            if let Some(idx) = found {
                return Ok(idx);
            }
        }
        let events = state
            .events
            .wait(state.window, FREE_BUFFER_POLL_TIMEOUT)
            .map_err(SwapError::Present)?;
        apply_effects(state, events.into_iter().map(Effect::from));
    }
}

/// Explicit-sync regime free-buffer wait: waits on each busy buffer's own
/// timeline for its last reserved release point to become available, and
/// promotes the first one that signals.
fn wait_explicit(inner: &mut Inner, kind: PoolKind, exclude: Option<usize>) -> Result<Option<usize>, SwapError> {
    let candidates: Vec<usize> = pool_mut(inner, kind).busy_indices().filter(|&i| Some(i) != exclude).collect();

    for idx in candidates {
        let point = match pool_mut(inner, kind).get(idx).timeline() {
            Some(timeline) => timeline.point(),
            None => continue,
        };
        let signalled = pool_mut(inner, kind)
            .get(idx)
            .timeline()
            .unwrap()
            .wait_available(point, FREE_BUFFER_POLL_TIMEOUT.as_millis() as u64)
            .is_ok();
        if signalled {
            pool_mut(inner, kind).recycle_to_tail(idx, BufferStatus::Idle);
            return pool_mut(inner, kind)
                .acquire_idle(exclude)
                .map_err(|err| SwapError::Pool(err.into()));
        }
    }
    Ok(None)
}

/// Implicit-sync regime free-buffer wait: polls the dma-buf fd of every
/// buffer the server has already released (`IdleNotified`) for `POLLOUT`,
/// which on most kernel GPU drivers indicates the buffer's implicit
/// write fence has retired.
fn wait_implicit(inner: &mut Inner, kind: PoolKind, exclude: Option<usize>) -> Result<Option<usize>, SwapError> {
    use rustix::event::{poll, PollFd, PollFlags};
    use std::os::unix::io::BorrowedFd;

    let candidates: Vec<usize> = pool_mut(inner, kind)
        .idle_notified_indices()
        .filter(|&i| Some(i) != exclude)
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    let raw_fds: Vec<(usize, std::os::unix::io::RawFd)> = candidates
        .into_iter()
        .filter_map(|idx| pool_mut(inner, kind).get(idx).dmabuf().handles().next().map(|fd| (idx, fd)))
        .collect();
    // SAFETY: each fd is a plane handle owned by a `ColorBuffer` still held
    // in the pool for the duration of this poll call.
    let borrowed: Vec<BorrowedFd<'_>> = raw_fds.iter().map(|&(_, fd)| unsafe { BorrowedFd::borrow_raw(fd) }).collect();
    let mut pollfds: Vec<PollFd<'_>> = borrowed.iter().map(|fd| PollFd::new(fd, PollFlags::OUT)).collect();

    let ready = poll(&mut pollfds, FREE_BUFFER_POLL_TIMEOUT.as_millis() as i32)
        .map_err(|err| SwapError::Pool(crate::error::PoolError::OpenDevice(std::io::Error::from(err))))?;
    if ready == 0 {
        return Ok(None);
    }

    for (&(idx, _), pollfd) in raw_fds.iter().zip(pollfds.iter()) {
        if pollfd.revents().contains(PollFlags::OUT) {
            pool_mut(inner, kind).recycle_to_tail(idx, BufferStatus::Idle);
            return pool_mut(inner, kind)
                .acquire_idle(exclude)
                .map_err(|err| SwapError::Pool(err.into()));
        }
    }
    Ok(None)
}

/// Issues the `PresentPixmap`/`PresentPixmapSynced` request for a buffer
/// that has already been rendered into, under `serial` — a window-owned
/// counter incremented by exactly 1 per present (mirroring the original's
/// `last_present_serial++`), not an XID minted via `generate_id()`: the
/// pending-count/`target_msc` arithmetic depends on a +1 stride, and XIDs
/// are never freed, so minting one per present would both break that
/// arithmetic and leak the id space over a long-running session.
pub fn present(
    connection: &RustConnection,
    window: Xid,
    pixmap: u32,
    serial: u32,
    sync: Sync,
    acquire_release: Option<(u32, u64, u64)>,
    swap_interval: i32,
    present_capabilities: u32,
    target_msc: u64,
) -> Result<(), SwapError> {
    let options = present_options(swap_interval, present_capabilities);

    match (sync, acquire_release) {
        (Sync::Explicit, Some((syncobj, acquire_point, release_point))) => {
            connection
                .present_pixmap_synced(
                    window,
                    pixmap,
                    serial,
                    x11rb::NONE,
                    x11rb::NONE,
                    0,
                    0,
                    x11rb::NONE,
                    syncobj,
                    syncobj,
                    acquire_point,
                    release_point,
                    options,
                    target_msc,
                    0,
                    0,
                    &[],
                )
                .map_err(|err| SwapError::Present(crate::error::PresentError::Protocol(err.to_string())))?;
        }
        _ => {
            connection
                .present_pixmap(
                    window,
                    pixmap,
                    serial,
                    x11rb::NONE,
                    x11rb::NONE,
                    0,
                    0,
                    x11rb::NONE,
                    x11rb::NONE,
                    x11rb::NONE,
                    options,
                    target_msc,
                    0,
                    0,
                    &[],
                )
                .map_err(|err| SwapError::Present(crate::error::PresentError::Protocol(err.to_string())))?;
        }
    }

    let _ = connection.flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_swap_interval_presents_immediately() {
        assert_eq!(target_msc(0, 5, 3, 100), 0);
    }

    #[test]
    fn target_msc_spaces_pending_presents_by_interval() {
        // one frame already in flight (serial 6 sent, 5 completed)
        assert_eq!(target_msc(1, 6, 5, 100), 101);
        assert_eq!(target_msc(2, 7, 5, 100), 104);
    }

    #[test]
    fn async_option_only_used_when_capability_present() {
        assert_eq!(present_options(0, CAP_ASYNC), u32::from(present::Option::ASYNC));
        assert_eq!(present_options(0, 0), u32::from(present::Option::NONE));
    }
}
