//! Driver callback surface (§4.6): the two hooks a GPU driver invokes while
//! it still holds its own internal locks. Each takes only the window's
//! mutex, never a display-wide lock, and is safe to call re-entrantly from
//! inside [`super::surface::WindowSurface::swap_buffers`] on the same
//! thread (see [`WindowState`]'s re-entrancy counter).

use std::sync::Arc;

use super::state::WindowState;
use super::swapchain;

/// Called by the driver right before it would otherwise block the calling
/// thread waiting for a free buffer to render into. Lets the adapter drain
/// the event pump and update pool/serial bookkeeping without the driver
/// having to know anything about Present.
///
/// Returns `false` without doing anything if the window is already
/// mid-swap or mid-teardown on this thread (§4.6: "if the re-entry counter
/// is non-zero ... it returns immediately"), since the code already
/// holding the scope owns the bookkeeping for this call. Callers use the
/// return value to decide whether a subsequent size-only reallocation
/// check is safe to run too.
pub fn update_callback_hook(state: &Arc<WindowState>) -> bool {
    if state.is_reentrant() {
        return false;
    }
    let _scope = state.enter_callback_scope();
    if let Err(err) = swapchain::pump_events(state) {
        tracing::debug!(window = state.window, error = %err, "update callback hook: event pump failed");
    }
    true
}

/// Called by the driver after it has recorded new damage for the window's
/// current back buffer. A window with `skip_update_callback` non-zero
/// (e.g. mid-resize) suppresses the damage bookkeeping this hook would
/// otherwise perform, without affecting `update_callback_hook`.
pub fn damage_callback_hook(state: &Arc<WindowState>) {
    let _scope = state.enter_callback_scope();
    let mut inner = state.lock();
    if inner.skip_update_callback > 0 {
        inner.skip_update_callback -= 1;
    }
}
