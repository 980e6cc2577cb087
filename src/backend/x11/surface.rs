//! The public per-window surface (§1, §4.5): `new`, `swap_buffers`,
//! `update_callback_hook`, `damage_callback_hook`.

use std::sync::{Arc, Mutex};

use drm_fourcc::DrmModifier as Modifier;
use gbm::BufferObjectFlags as GbmBufferFlags;
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::ConnectionExt as _;

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::allocator::gbm::GbmAllocator;
use crate::backend::drm::RenderDevice;
use crate::error::{AdapterError, SwapError};
use crate::external::{DriverCallbacks, FormatInfo, NativeWindowHandle};

use super::callbacks;
use super::event_pump::EventPump;
use super::format::{self, NegotiationOutcome};
use super::state::WindowState;
use super::swapchain;
use super::sync::{Sync, SyncCapabilities};

/// A presentable surface bound to one native X window.
///
/// Generic over `W`, the driver's own opaque per-window handle, so the
/// update/damage callbacks can call back into the driver without this
/// crate needing to know anything about it beyond `DriverCallbacks<W>`'s
/// function pointers.
#[derive(Debug)]
pub struct WindowSurface<W> {
    state: Arc<WindowState>,
    device: Arc<RenderDevice>,
    callbacks: Option<DriverCallbacks<W>>,
    driver_window: Option<W>,
    /// Index into the direct pool of the buffer the driver is currently
    /// rendering into.
    current: Option<usize>,
    /// Index into the direct pool of the buffer last promoted to front,
    /// reported to the driver via `set_color_buffers` after a reallocation.
    front: Option<usize>,
}

impl<W> WindowSurface<W> {
    /// Negotiates a format/modifier/sync regime for `window` and allocates
    /// its buffer pools.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        window: &dyn NativeWindowHandle,
        events: Arc<EventPump>,
        device: Arc<RenderDevice>,
        allocator: Arc<Mutex<GbmAllocator<RenderDevice>>>,
        format: FormatInfo,
        driver_modifiers: &[Modifier],
        allow_offload: bool,
        sync_caps: SyncCapabilities,
        present_capabilities: u32,
        dri3_supports_multiplane: bool,
        flags: GbmBufferFlags,
        callbacks: Option<DriverCallbacks<W>>,
        driver_window: Option<W>,
    ) -> Result<Self, AdapterError> {
        let connection = window.connection().clone();
        let xid = window.xid();

        let negotiated = format::negotiate(&connection, xid, format.depth, format.bpp, driver_modifiers, allow_offload)
            .map_err(AdapterError::from)?;

        let geometry = connection
            .get_geometry(xid)
            .map_err(|err| AdapterError::Critical(err.to_string()))?
            .reply()
            .map_err(|err| AdapterError::Critical(err.to_string()))?;

        let sync = Sync::select(sync_caps);
        let requires_offload = matches!(negotiated.outcome, NegotiationOutcome::Offload);
        let modifier = negotiated.modifiers.first().copied().unwrap_or(Modifier::Linear);

        let state = WindowState::new(
            connection,
            events,
            xid,
            geometry.width as u32,
            geometry.height as u32,
            format.fourcc,
            modifier,
            allocator,
            flags,
            sync,
            present_capabilities,
            format.depth,
            format.bpp,
            dri3_supports_multiplane,
            driver_modifiers.to_vec(),
            allow_offload,
            requires_offload,
        )
        .map_err(AdapterError::from)?;

        Ok(WindowSurface {
            state,
            device,
            callbacks,
            driver_window,
            current: None,
            front: None,
        })
    }

    /// The native buffer backing the window's current back buffer,
    /// allocating or waiting for a free one as needed. The driver renders
    /// into this directly; this crate never inspects its contents.
    pub fn back_buffer(&mut self) -> Result<Dmabuf, AdapterError> {
        if self.current.is_none() {
            let idx =
                swapchain::wait_for_free_buffer(&self.state, swapchain::PoolKind::Direct, None).map_err(AdapterError::from)?;
            self.current = Some(idx);
        }

        let inner = self.state.lock();
        let idx = self.current.expect("back buffer just ensured");
        Ok(inner.pools.direct.get(idx).dmabuf().clone())
    }

    /// Presents the current back buffer and advances to the next one,
    /// implementing the ten-step swap sequence (§4.5): enter the
    /// re-entrant critical section, reject a destroyed window, blit to a
    /// linear intermediate in offload mode, ensure the pixmap exists,
    /// attach a fence per the window's sync regime, throttle on outstanding
    /// presents, compute `target_msc`, submit, reallocate if a resize or
    /// modifier re-check is pending, and acquire the next back buffer.
    pub fn swap_buffers(&mut self) -> Result<(), AdapterError> {
        // Step 1: re-entrant critical section. The driver may call back
        // into `update_callback_hook`/`damage_callback_hook` on the same
        // thread while this is held; those early-out on the counter.
        let _scope = self.state.enter_callback_scope();

        swapchain::pump_events(&self.state).map_err(AdapterError::from)?;

        // Step 2: reject a destroyed window up front.
        if self.state.lock().native_destroyed {
            return Err(SwapError::WindowDestroyed.into());
        }

        let idx = match self.current {
            Some(idx) => idx,
            None => {
                let idx = swapchain::wait_for_free_buffer(&self.state, swapchain::PoolKind::Direct, None)
                    .map_err(AdapterError::from)?;
                self.current = Some(idx);
                idx
            }
        };

        if self.state.lock().native_destroyed {
            return Err(SwapError::WindowDestroyed.into());
        }

        // Step 3: offload (PRIME) mode blits the rendered back buffer into
        // a free linear intermediate; everything downstream presents the
        // intermediate instead of the direct back buffer.
        let force_prime = self.state.lock().force_prime;
        let present_target = if force_prime {
            let intermediate_idx =
                swapchain::wait_for_free_buffer(&self.state, swapchain::PoolKind::Intermediate, None)
                    .map_err(AdapterError::from)?;
            self.blit_to_intermediate(idx, intermediate_idx)?;
            (swapchain::PoolKind::Intermediate, intermediate_idx)
        } else {
            (swapchain::PoolKind::Direct, idx)
        };

        let (pixmap, sync, acquire_release, swap_interval, present_capabilities, target_msc, window, dri3_multiplane, depth) = {
            let mut inner = self.state.lock();
            let dri3_multiplane = self.state.dri3_supports_multiplane;
            let depth = self.state.depth;
            let buffer = swapchain::pool_mut(&mut inner, present_target.0).get_mut(present_target.1);
            let pixmap = buffer
                .ensure_pixmap(&self.state.connection, self.state.window, depth, dri3_multiplane)
                .map_err(AdapterError::from)?;

            // Step 5: synchronize end of rendering. Under offload, the
            // fence guards the work the GPU blit depends on, so it is
            // still attached to the *presented* (intermediate) buffer's
            // timeline/dma-buf, not the direct back buffer's.
            //
            // A window selected for `Implicit` at creation time still
            // degrades to the same driver-stall the `Finish` regime uses
            // the moment the process-wide import-sync-file flag trips
            // (§4.5.1/S4) — the regime itself stays fixed per-window, but
            // this one ioctl's availability is re-checked every swap.
            let acquire_release = match inner.sync {
                Sync::Explicit => {
                    let fence = self.callbacks.as_ref().and_then(|cbs| (cbs.create_rendering_fence)());
                    let timeline = buffer
                        .ensure_timeline(self.device.clone(), self.state.connection.clone(), self.state.window)
                        .map_err(AdapterError::from)?;
                    let (acquire, release) = timeline.reserve_next(fence).map_err(AdapterError::from)?;
                    Some((timeline.xid(), acquire, release))
                }
                Sync::Implicit if super::sync::import_sync_file_available() => {
                    if let Some(fence) = self.callbacks.as_ref().and_then(|cbs| (cbs.create_rendering_fence)()) {
                        if let Some(raw_fd) = buffer.dmabuf().handles().next() {
                            // SAFETY: `raw_fd` is a plane handle owned by
                            // `buffer`, which outlives this call.
                            let plane_fd = unsafe { std::os::unix::io::BorrowedFd::borrow_raw(raw_fd) };
                            if let Err(err) = super::sync::import_sync_file(plane_fd, fence) {
                                if super::sync::is_import_sync_file_disabling_error(&err) {
                                    super::sync::disable_import_sync_file();
                                    if let Some(cbs) = self.callbacks.as_ref() {
                                        (cbs.finish_rendering)();
                                    }
                                } else {
                                    tracing::debug!(window = self.state.window, error = %err, "import-sync-file failed");
                                }
                            }
                        }
                    }
                    None
                }
                Sync::Implicit | Sync::Finish => {
                    if let Some(cbs) = self.callbacks.as_ref() {
                        (cbs.finish_rendering)();
                    }
                    None
                }
            };

            let target_msc = swapchain::target_msc(
                inner.swap_interval,
                inner.last_sent_serial,
                inner.last_completed_serial,
                inner.last_completed_msc,
            );

            (
                pixmap,
                inner.sync,
                acquire_release,
                inner.swap_interval,
                inner.present_capabilities,
                target_msc,
                self.state.window,
                dri3_multiplane,
                depth,
            )
        };
        let _ = (dri3_multiplane, depth);

        // Step 6: throttle to at most one outstanding present before
        // submitting another, per §4.5/S5 — blocks on window events until
        // the bound holds.
        swapchain::throttle_outstanding_presents(&self.state).map_err(AdapterError::from)?;

        // Step 7: submit, under a window-owned serial counter incremented
        // by exactly 1 per present (mirroring the original's
        // `last_present_serial++`); the pending-count/`target_msc`
        // arithmetic above assumes that +1 stride.
        let serial = {
            let inner = self.state.lock();
            inner.last_sent_serial.wrapping_add(1)
        };
        swapchain::present(
            &self.state.connection,
            window,
            pixmap,
            serial,
            sync,
            acquire_release,
            swap_interval,
            present_capabilities,
            target_msc,
        )?;

        {
            let mut inner = self.state.lock();
            inner.last_sent_serial = serial;
            swapchain::pool_mut(&mut inner, present_target.0)
                .get_mut(present_target.1)
                .mark_in_use(serial);
        }

        // Step 8: re-check for resize / modifier changes; reallocate the
        // pools if either is pending.
        let reallocated = swapchain::reallocate_if_needed(&self.state)?;

        // Step 9: rotate the pool. A reallocation starts both pools empty,
        // so front and back are freshly (re-)acquired; otherwise the old
        // back is promoted to front and a fresh buffer becomes the new
        // back — or, in offload mode, front and back simply swap roles,
        // since the server only ever sees the intermediate pool.
        if reallocated {
            self.current = None;
            self.front = None;
            let back = swapchain::wait_for_free_buffer(&self.state, swapchain::PoolKind::Direct, None)
                .map_err(AdapterError::from)?;
            let front = swapchain::wait_for_free_buffer(&self.state, swapchain::PoolKind::Direct, Some(back))
                .map_err(AdapterError::from)?;
            self.current = Some(back);
            self.front = Some(front);
        } else if force_prime {
            let new_back = match self.front.take() {
                Some(prev_front) => prev_front,
                None => swapchain::wait_for_free_buffer(&self.state, swapchain::PoolKind::Direct, Some(idx))
                    .map_err(AdapterError::from)?,
            };
            self.front = Some(idx);
            self.current = Some(new_back);
        } else {
            let next = swapchain::wait_for_free_buffer(&self.state, swapchain::PoolKind::Direct, Some(idx))
                .map_err(AdapterError::from)?;
            self.front = Some(idx);
            self.current = Some(next);
        }

        self.notify_driver_color_buffers();

        if let Some(callbacks) = &self.callbacks {
            if let Some(window) = &self.driver_window {
                (callbacks.on_update)(window);
            }
        }

        // Step 10: the critical section is released when `_scope` drops at
        // function exit, decrementing the re-entry counter.
        Ok(())
    }

    /// Offload (PRIME) step 3: GPU-blits the driver's direct back buffer
    /// into a linear intermediate via the driver's own blit entry point,
    /// lazily importing both sides as driver color buffers first. A
    /// window with no driver callbacks attached (e.g. in tests) has
    /// nothing to blit through and is a no-op.
    fn blit_to_intermediate(&mut self, back_idx: usize, intermediate_idx: usize) -> Result<(), AdapterError> {
        let cbs = match &self.callbacks {
            Some(cbs) => cbs.clone(),
            None => return Ok(()),
        };

        let mut inner = self.state.lock();
        inner
            .pools
            .direct
            .get_mut(back_idx)
            .ensure_driver_token(cbs.import_color_buffer, cbs.free_color_buffer);
        inner
            .pools
            .intermediate
            .as_mut()
            .expect("offload window has an intermediate pool")
            .get_mut(intermediate_idx)
            .ensure_driver_token(cbs.import_color_buffer, cbs.free_color_buffer);

        let src = inner
            .pools
            .direct
            .get(back_idx)
            .driver_token()
            .expect("driver token just ensured");
        let dst = inner
            .pools
            .intermediate
            .as_ref()
            .unwrap()
            .get(intermediate_idx)
            .driver_token()
            .expect("driver token just ensured");

        if !(cbs.copy_color_buffer)(src, dst) {
            return Err(AdapterError::Critical(
                "driver GPU blit into offload intermediate failed".to_string(),
            ));
        }
        Ok(())
    }

    /// Tells the driver which buffers now back this window's front/back/
    /// intermediate slots, per §4.5.2's "driver is told about the new
    /// front/back/intermediate via a single `set color buffers` call" —
    /// issued after every reallocation. A window with no driver callbacks
    /// attached has nothing to notify.
    fn notify_driver_color_buffers(&mut self) {
        let cbs = match &self.callbacks {
            Some(cbs) => cbs.clone(),
            None => return,
        };
        let driver_window = match &self.driver_window {
            Some(window) => window,
            None => return,
        };
        let (front_idx, back_idx) = match (self.front, self.current) {
            (Some(f), Some(b)) => (f, b),
            _ => return,
        };

        let mut inner = self.state.lock();
        inner
            .pools
            .direct
            .get_mut(front_idx)
            .ensure_driver_token(cbs.import_color_buffer, cbs.free_color_buffer);
        inner
            .pools
            .direct
            .get_mut(back_idx)
            .ensure_driver_token(cbs.import_color_buffer, cbs.free_color_buffer);

        // An offload window always has an intermediate to report, even
        // right after a reallocation clears the pool; `acquire_idle` on a
        // freshly emptied pool allocates without blocking.
        let intermediate_idx = if inner.force_prime {
            inner
                .pools
                .intermediate
                .as_mut()
                .and_then(|pool| pool.acquire_idle(None).ok().flatten())
        } else {
            None
        };
        if let Some(idx) = intermediate_idx {
            inner
                .pools
                .intermediate
                .as_mut()
                .unwrap()
                .get_mut(idx)
                .ensure_driver_token(cbs.import_color_buffer, cbs.free_color_buffer);
        }

        let front = inner.pools.direct.get(front_idx).driver_token().expect("token just ensured");
        let back = inner.pools.direct.get(back_idx).driver_token().expect("token just ensured");
        let intermediate = intermediate_idx
            .and_then(|idx| inner.pools.intermediate.as_ref().unwrap().get(idx).driver_token());

        (cbs.set_color_buffers)(driver_window, front, back, intermediate);
    }

    /// Called by the driver when it would otherwise block waiting for a
    /// free buffer; drains events and, if the re-entrancy counter allows
    /// it, applies a size-only reallocation (§4.6). Modifier re-checks are
    /// always deferred to the next `swap_buffers` call, since reallocating
    /// against a new modifier needs a server round-trip the callback
    /// locking discipline forbids here.
    pub fn update_callback_hook(&mut self) {
        if !callbacks::update_callback_hook(&self.state) {
            return;
        }

        let should_resize = {
            let inner = self.state.lock();
            swapchain::pending_resize_differs(&inner)
        };
        if should_resize {
            let (width, height, modifier) = {
                let inner = self.state.lock();
                let (width, height) = swapchain::reallocation_target_size(&inner);
                (width, height, inner.modifier)
            };
            {
                let mut inner = self.state.lock();
                swapchain::reallocate_pools(&self.state.connection, &mut inner, width, height, modifier);
            }
            self.current = None;
            self.front = None;
            self.notify_driver_color_buffers();
        }

        if let (Some(cbs), Some(window)) = (&self.callbacks, &self.driver_window) {
            (cbs.on_update)(window);
        }
    }

    /// Called by the driver after recording new damage for the current
    /// back buffer.
    pub fn damage_callback_hook(&self) {
        callbacks::damage_callback_hook(&self.state);
        if let (Some(cbs), Some(window)) = (&self.callbacks, &self.driver_window) {
            (cbs.on_damage)(window);
        }
    }
}

impl<W> Drop for WindowSurface<W> {
    fn drop(&mut self) {
        self.state.unregister();
    }
}
