//! Present event pump (§4.4): a passive consumer, not a background thread.
//! Events are drained from the shared X connection only at well-defined
//! synchronization points — a non-blocking poll during swap/update-callback,
//! or a bounded blocking wait when the buffer pool is exhausted.
//!
//! The connection is shared by every window on a [`DisplayInstance`]
//! (`super::DisplayInstance`), and x11rb flattens Present's sub-events into
//! the same top-level [`Event`] stream as everything else, so a read
//! destined for window A can return an event for window B. [`EventPump`]
//! keeps a small per-window backlog so that event never gets lost: whichever
//! thread happens to be reading routes it to the right window and moves on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::Window as Xid;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::error::PresentError;

/// Bit set in `ConfigureNotify.pixmap_flags` when the window behind this
/// Present event context has been destroyed.
const PIXMAP_FLAG_DESTROYED: u32 = 1;

/// Present extension mode value meaning the server had to composite the
/// frame rather than flip or copy it directly — the signal that a pool's
/// chosen modifier may no longer be optimal.
const COMPLETE_MODE_SUBOPTIMAL_COPY: u8 = 3;

/// A Present sub-event, decoded and stripped of everything the swap-chain
/// state machine does not need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentEvent {
    /// New pending geometry, and whether the window has been destroyed.
    Configure { width: u16, height: u16, destroyed: bool },
    /// The server released a pixmap; correlates back to a buffer by XID and
    /// the serial it was last presented under.
    IdleNotify { pixmap: u32, serial: u32 },
    /// A present completed at `msc`; `suboptimal` is set when the server
    /// says it had to fall back to compositing this frame.
    CompleteNotify { serial: u32, msc: u64, suboptimal: bool },
}

/// Interprets a raw Present sub-event for `window`, or `None` if it is not
/// one of the three events the swap-chain state machine cares about, or not
/// addressed to `window`.
fn decode(event: &Event, window: Xid) -> Option<PresentEvent> {
    match event {
        Event::PresentConfigureNotify(ev) if ev.window == window => Some(PresentEvent::Configure {
            width: ev.width,
            height: ev.height,
            destroyed: ev.pixmap_flags & PIXMAP_FLAG_DESTROYED != 0,
        }),
        Event::PresentIdleNotify(ev) if ev.window == window => Some(PresentEvent::IdleNotify {
            pixmap: ev.pixmap,
            serial: ev.serial,
        }),
        Event::PresentCompleteNotify(ev) if ev.window == window => Some(PresentEvent::CompleteNotify {
            serial: ev.serial,
            msc: ev.msc,
            suboptimal: ev.mode == COMPLETE_MODE_SUBOPTIMAL_COPY,
        }),
        _ => None,
    }
}

/// The window a raw event targets, for events this pump cares about routing.
fn target_window(event: &Event) -> Option<Xid> {
    match event {
        Event::PresentConfigureNotify(ev) => Some(ev.window),
        Event::PresentIdleNotify(ev) => Some(ev.window),
        Event::PresentCompleteNotify(ev) => Some(ev.window),
        _ => None,
    }
}

/// Shared, passive Present event reader for every window on one display
/// connection.
#[derive(Debug)]
pub struct EventPump {
    connection: std::sync::Arc<RustConnection>,
    backlog: Mutex<HashMap<Xid, VecDeque<PresentEvent>>>,
    /// Set once an [`event_source`](super::event_source) calloop integration
    /// takes over reading the socket, so [`Self::drain_socket`] stops also
    /// calling `poll_for_event` itself — the connection's event queue is a
    /// single destructive-read stream and can only have one consumer.
    externally_driven: AtomicBool,
}

impl EventPump {
    pub fn new(connection: std::sync::Arc<RustConnection>) -> Self {
        EventPump {
            connection,
            backlog: Mutex::new(HashMap::new()),
            externally_driven: AtomicBool::new(false),
        }
    }

    /// Marks this pump as fed externally (by a calloop event source reading
    /// the connection on a background thread) rather than by its own
    /// `poll`/`wait` callers.
    pub fn set_externally_driven(&self, driven: bool) {
        self.externally_driven.store(driven, Ordering::Release);
    }

    /// Routes one already-read event into its window's backlog. Used by an
    /// external reader (e.g. a calloop [`event_source`](super::event_source))
    /// that owns the actual `wait_for_event`/`poll_for_event` call.
    pub fn ingest(&self, event: Event) {
        if let Some(window) = target_window(&event) {
            if let Some(decoded) = decode(&event, window) {
                self.backlog.lock().unwrap().entry(window).or_default().push_back(decoded);
            }
        }
    }

    /// Registers `window` so events routed to it before its first poll are
    /// not silently dropped as "unknown window".
    pub fn register(&self, window: Xid) {
        self.backlog.lock().unwrap().entry(window).or_default();
    }

    /// Drops `window`'s backlog once its surface is destroyed.
    pub fn unregister(&self, window: Xid) {
        self.backlog.lock().unwrap().remove(&window);
    }

    /// Drains whatever is immediately available on the connection without
    /// blocking, routing each event to its window's backlog, then returns
    /// everything now queued for `window`.
    pub fn poll(&self, window: Xid) -> Result<Vec<PresentEvent>, PresentError> {
        self.drain_socket()?;
        let mut backlog = self.backlog.lock().unwrap();
        Ok(backlog.entry(window).or_default().drain(..).collect())
    }

    /// Blocks up to `timeout`, polling the connection in short increments,
    /// until at least one event destined for `window` is seen or the
    /// timeout elapses. Returns whatever accumulated for `window` (possibly
    /// empty, on timeout).
    pub fn wait(&self, window: Xid, timeout: Duration) -> Result<Vec<PresentEvent>, PresentError> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.poll(window)?;
            if !events.is_empty() {
                return Ok(events);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Reads everything immediately queued on the socket (non-blocking) and
    /// files it into the right window's backlog. A no-op once an external
    /// reader has taken over the connection's socket.
    fn drain_socket(&self) -> Result<(), PresentError> {
        if self.externally_driven.load(Ordering::Acquire) {
            return Ok(());
        }
        loop {
            let event = self
                .connection
                .poll_for_event()
                .map_err(|err| PresentError::Protocol(err.to_string()))?;
            let Some(event) = event else {
                return Ok(());
            };

            // Events for extensions/windows we do not track are dropped:
            // the rest of this crate never registers interest in anything
            // but Present sub-events on windows it created surfaces for.
            self.ingest(event);
        }
    }
}

/// A decoded event's effect on per-buffer/per-window bookkeeping, applied by
/// the caller against its own `WindowState`/`ColorBufferPool` (kept free of
/// those types here so this module only knows about wire decoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Pending geometry changed; window may also now be destroyed.
    Resize { width: u16, height: u16, destroyed: bool },
    /// A buffer matching (pixmap, serial) should move `InUse -> IdleNotified`.
    ReleaseBuffer { pixmap: u32, serial: u32 },
    /// `last_completed_serial`/`msc` should advance if `serial` is newer.
    Completed { serial: u32, msc: u64, suboptimal: bool },
}

impl From<PresentEvent> for Effect {
    fn from(event: PresentEvent) -> Self {
        match event {
            PresentEvent::Configure {
                width,
                height,
                destroyed,
            } => Effect::Resize {
                width,
                height,
                destroyed,
            },
            PresentEvent::IdleNotify { pixmap, serial } => Effect::ReleaseBuffer { pixmap, serial },
            PresentEvent::CompleteNotify { serial, msc, suboptimal } => Effect::Completed {
                serial,
                msc,
                suboptimal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suboptimal_copy_mode_is_recognized() {
        let event = PresentEvent::CompleteNotify {
            serial: 1,
            msc: 2,
            suboptimal: true,
        };
        match Effect::from(event) {
            Effect::Completed { suboptimal, .. } => assert!(suboptimal),
            _ => panic!("wrong effect variant"),
        }
    }

    #[test]
    fn configure_destroyed_bit_maps_to_resize_effect() {
        let event = PresentEvent::Configure {
            width: 640,
            height: 480,
            destroyed: true,
        };
        match Effect::from(event) {
            Effect::Resize { destroyed, width, height } => {
                assert!(destroyed);
                assert_eq!((width, height), (640, 480));
            }
            _ => panic!("wrong effect variant"),
        }
    }
}
