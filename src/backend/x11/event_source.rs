//! calloop integration (§4.4, optional `event_source` feature): a background
//! thread that reads the shared connection and feeds [`EventPump`] so a
//! calloop-driven consumer does not have to call `poll`/`wait` itself.
//!
//! The background thread is the connection's only reader once this source
//! exists: `wait_for_event()` can itself read and buffer further events
//! while blocked, so polling the raw socket fd for readiness is not enough,
//! and a second independent reader would race the pump for the same
//! destructive-read stream. [`EventPump::set_externally_driven`] disables
//! the pump's own socket reads accordingly; everything still goes through
//! [`EventPump::poll`]/[`EventPump::wait`] to reach a window's backlog.

use std::io::Result as IOResult;
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};

use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{Atom, ClientMessageEvent, ConnectionExt as _, EventMask, Window, CLIENT_MESSAGE_EVENT};
use x11rb::rust_connection::RustConnection;

use calloop::channel::{sync_channel, Channel, Event as ChannelEvent, SyncSender};
use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};

use super::event_pump::EventPump;

/// calloop source that wakes a consumer whenever the background thread has
/// fed new events into `pump`. Carries no event payload of its own: the
/// payload already lives in the pump's per-window backlogs, reachable via
/// `poll`/`wait`.
#[derive(Debug)]
pub struct X11Source {
    connection: Arc<RustConnection>,
    pump: Arc<EventPump>,
    channel: Option<Channel<()>>,
    event_thread: Option<JoinHandle<()>>,
    close_window: Window,
    close_type: Atom,
}

impl X11Source {
    /// Creates a new source feeding `pump`, marking it externally driven for
    /// as long as this source lives. On drop, a `ClientMessageEvent` of
    /// `close_type` is sent to `close_window` (expected to be a window we
    /// created) to wake the worker thread so it observes the closed channel
    /// and exits, and the pump reverts to self-driven.
    pub fn new(connection: Arc<RustConnection>, pump: Arc<EventPump>, close_window: Window, close_type: Atom) -> Self {
        pump.set_externally_driven(true);

        let (sender, channel) = sync_channel(5);
        let conn = Arc::clone(&connection);
        let thread_pump = Arc::clone(&pump);
        let event_thread = Some(spawn(move || run_event_thread(conn, thread_pump, sender)));

        Self {
            connection,
            pump,
            channel: Some(channel),
            event_thread,
            close_window,
            close_type,
        }
    }
}

impl Drop for X11Source {
    fn drop(&mut self) {
        self.channel.take();

        let event = ClientMessageEvent {
            response_type: CLIENT_MESSAGE_EVENT,
            format: 8,
            sequence: 0,
            window: self.close_window,
            type_: self.close_type,
            data: [0; 20].into(),
        };

        let _ = self
            .connection
            .send_event(false, self.close_window, EventMask::NO_EVENT, event);
        let _ = self.connection.flush();

        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }

        self.pump.set_externally_driven(false);
    }
}

impl EventSource for X11Source {
    type Event = ();
    type Metadata = ();
    type Ret = ();

    fn process_events<C>(&mut self, readiness: Readiness, token: Token, mut callback: C) -> IOResult<PostAction>
    where
        C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        if let Some(channel) = &mut self.channel {
            channel.process_events(readiness, token, move |event, meta| match event {
                ChannelEvent::Closed => tracing::warn!("x11 event thread exited"),
                ChannelEvent::Msg(()) => {
                    callback((), meta);
                }
            })
        } else {
            Ok(PostAction::Remove)
        }
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> IOResult<()> {
        if let Some(channel) = &mut self.channel {
            channel.register(poll, factory)?;
        }
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> IOResult<()> {
        if let Some(channel) = &mut self.channel {
            channel.reregister(poll, factory)?;
        }
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> IOResult<()> {
        if let Some(channel) = &mut self.channel {
            channel.unregister(poll)?;
        }
        Ok(())
    }
}

fn run_event_thread(connection: Arc<RustConnection>, pump: Arc<EventPump>, sender: SyncSender<()>) {
    loop {
        let event = match connection.wait_for_event() {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = %err, "x11 event thread exiting: connection error");
                break;
            }
        };
        pump.ingest(event);
        if sender.send(()).is_err() {
            break;
        }
    }
}
