//! Per-window format & modifier negotiation (§4.1).
//!
//! Reconciles the driver's renderable modifiers (resolved from the
//! caller-supplied `EGLConfig`, outside this crate) against what the X
//! server will accept for this window, via the DRI3 `GetSupportedModifiers`
//! request.

use drm_fourcc::DrmModifier as Modifier;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::Window as Xid;
use x11rb::rust_connection::RustConnection;

use crate::error::FormatError;

/// Which step of the negotiation algorithm produced a [`ModifierSet`] — the
/// caller needs this to decide the window's `prime`/`force_prime` flags and
/// which buffer-pool pairing (direct-only vs direct+intermediate) to set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Step 2: driver and server agree on a modifier the server can scan
    /// this window's pixmaps out with directly.
    DirectPerWindow,
    /// Step 3: no per-window match, but the server can still scan out
    /// directly somewhere on screen (server-blit path); only taken when the
    /// client is not permitted to offload.
    DirectServerBlit,
    /// Step 4: no scanout-capable match at all; render to a linear
    /// intermediate and GPU-blit to a presentable buffer.
    Offload,
}

/// Result of negotiating a common set of modifiers for a window.
#[derive(Debug, Clone)]
pub struct ModifierSet {
    /// Modifiers to allocate the (direct or intermediate) buffer pool with.
    pub modifiers: Vec<Modifier>,
    /// Which step of §4.1's algorithm this result came from.
    pub outcome: NegotiationOutcome,
}

impl ModifierSet {
    /// Whether this outcome requires a linear-intermediate pool and a
    /// GPU-blit before presenting (§4.5 step 3).
    pub fn requires_offload(&self) -> bool {
        self.outcome == NegotiationOutcome::Offload
    }
}

/// Queries the server's per-window and per-screen supported modifier lists
/// and intersects each, in turn, with `driver_modifiers`, per §4.1's
/// five-step algorithm.
pub fn negotiate(
    connection: &RustConnection,
    window: Xid,
    depth: u8,
    bpp: u8,
    driver_modifiers: &[Modifier],
    allow_offload: bool,
) -> Result<ModifierSet, FormatError> {
    let reply = connection
        .dri3_get_supported_modifiers(window, depth as u32, bpp as u32)
        .map_err(|err| FormatError::QueryFailed(err.to_string()))?
        .reply()
        .map_err(|err| FormatError::QueryFailed(err.to_string()))?;

    let window_modifiers: Vec<Modifier> = reply.window_modifiers.iter().copied().map(Modifier::from).collect();
    let screen_modifiers: Vec<Modifier> = reply.screen_modifiers.iter().copied().map(Modifier::from).collect();

    // Step 2: per-window intersection.
    let per_window: Vec<Modifier> = driver_modifiers
        .iter()
        .copied()
        .filter(|m| window_modifiers.contains(m))
        .collect();
    if !per_window.is_empty() {
        return Ok(ModifierSet {
            modifiers: per_window,
            outcome: NegotiationOutcome::DirectPerWindow,
        });
    }

    // Step 3: per-screen intersection, only a valid outcome when the client
    // cannot offload — otherwise offload is preferred over a server-blit.
    let per_screen: Vec<Modifier> = driver_modifiers
        .iter()
        .copied()
        .filter(|m| screen_modifiers.contains(m))
        .collect();
    if !per_screen.is_empty() && !allow_offload {
        return Ok(ModifierSet {
            modifiers: per_screen,
            outcome: NegotiationOutcome::DirectServerBlit,
        });
    }

    // Step 4: offload. The back buffer stays driver-renderable (it's never
    // shown to the server directly, only GPU-blit into a linear
    // intermediate); the intermediate pool is forced to `Modifier::Linear`
    // by its own caller, not by this result.
    if allow_offload {
        tracing::debug!(window, "no common scanout modifier, falling back to PRIME offload");
        return Ok(ModifierSet {
            modifiers: driver_modifiers.to_vec(),
            outcome: NegotiationOutcome::Offload,
        });
    }

    // Step 5: fail.
    Err(FormatError::NoCommonModifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intersect(driver: &[Modifier], server: &[Modifier]) -> Vec<Modifier> {
        driver.iter().copied().filter(|m| server.contains(m)).collect()
    }

    #[test]
    fn per_window_match_wins_over_per_screen() {
        let driver = [Modifier::Linear, Modifier::Invalid];
        let window = [Modifier::Invalid];
        let screen = [Modifier::Linear];
        assert_eq!(intersect(&driver, &window), vec![Modifier::Invalid]);
        assert_eq!(intersect(&driver, &screen), vec![Modifier::Linear]);
    }

    #[test]
    fn offload_keeps_driver_renderable_modifier_for_the_back_buffer() {
        // The intermediate pool is forced to `Modifier::Linear` by its own
        // caller (`state.rs`); the back buffer stays driver-renderable so
        // the GPU blit into the intermediate has a real source to read.
        let set = ModifierSet {
            modifiers: vec![Modifier::Invalid],
            outcome: NegotiationOutcome::Offload,
        };
        assert!(set.requires_offload());
        assert_eq!(set.modifiers, vec![Modifier::Invalid]);
    }

    #[test]
    fn server_blit_does_not_require_offload() {
        let set = ModifierSet {
            modifiers: vec![Modifier::Linear],
            outcome: NegotiationOutcome::DirectServerBlit,
        };
        assert!(!set.requires_offload());
    }
}
