//! Event decoding and the dispatch loop.
//!
//! Protocol events are decoded exactly once at the boundary into
//! [`EventRecord`], a closed variant carrying only the fields each handler
//! needs. [`pump`] is the system's only blocking point; [`dispatch`] routes
//! one record per call and absorbs per-event failures. Window-side records
//! route through [`route_window_event`], generic over [`WindowServer`] so
//! the state transitions run against a fake in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::{debug, info, warn};
use x11rb::protocol::Event;
use x11rb::protocol::xproto::*;

use crate::keyboard::{KeyAction, Keyboard};
use crate::launcher::{self, Launcher, LauncherReply};
use crate::session::DisplaySession;
use crate::window::{
    ACCENT_BORDER_COLOR, MANAGED_BORDER_WIDTH, WindowEntity, WindowRegistry, WindowServer,
};

/// Button1 | Button2 | Button3 held-down bits in an event state mask.
const BUTTON_HELD_MASK: u16 = 0x0700;

/// Pointer and key input fields shared by key, button, and motion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRecord {
    pub detail: u8,
    pub state: u16,
    pub window: u32,
    pub root: u32,
    pub child: u32,
    pub time: u32,
    pub root_x: i16,
    pub root_y: i16,
    pub event_x: i16,
    pub event_y: i16,
}

/// A client's configure request, preserved field-for-field with its mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureRequestRecord {
    pub window: u32,
    pub value_mask: u16,
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
    pub sibling: u32,
    pub stack_mode: StackMode,
}

impl ConfigureRequestRecord {
    /// Build the forwarding request with exactly the fields the client
    /// asked for. x11rb serializes the masked values in the fixed protocol
    /// order (x, y, width, height, border width, sibling, stack mode).
    pub fn to_aux(&self) -> ConfigureWindowAux {
        let mut aux = ConfigureWindowAux::new();
        if self.value_mask & u16::from(ConfigWindow::X) != 0 {
            aux = aux.x(i32::from(self.x));
        }
        if self.value_mask & u16::from(ConfigWindow::Y) != 0 {
            aux = aux.y(i32::from(self.y));
        }
        if self.value_mask & u16::from(ConfigWindow::WIDTH) != 0 {
            aux = aux.width(u32::from(self.width));
        }
        if self.value_mask & u16::from(ConfigWindow::HEIGHT) != 0 {
            aux = aux.height(u32::from(self.height));
        }
        if self.value_mask & u16::from(ConfigWindow::BORDER_WIDTH) != 0 {
            aux = aux.border_width(u32::from(self.border_width));
        }
        if self.value_mask & u16::from(ConfigWindow::SIBLING) != 0 {
            aux = aux.sibling(self.sibling);
        }
        if self.value_mask & u16::from(ConfigWindow::STACK_MODE) != 0 {
            aux = aux.stack_mode(self.stack_mode);
        }
        aux
    }
}

/// The events this window manager reacts to, decoded once per loop
/// iteration and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRecord {
    MapRequest { window: u32 },
    ConfigureRequest(ConfigureRequestRecord),
    UnmapNotify { window: u32 },
    DestroyNotify { window: u32 },
    KeyPress(InputRecord),
    ButtonPress(InputRecord),
    ButtonRelease(InputRecord),
    MotionNotify(InputRecord),
    Unknown(u8),
}

impl From<Event> for EventRecord {
    fn from(event: Event) -> Self {
        match event {
            Event::MapRequest(e) => EventRecord::MapRequest { window: e.window },
            Event::ConfigureRequest(e) => EventRecord::ConfigureRequest(ConfigureRequestRecord {
                window: e.window,
                value_mask: u16::from(e.value_mask),
                x: e.x,
                y: e.y,
                width: e.width,
                height: e.height,
                border_width: e.border_width,
                sibling: e.sibling,
                stack_mode: e.stack_mode,
            }),
            Event::UnmapNotify(e) => EventRecord::UnmapNotify { window: e.window },
            Event::DestroyNotify(e) => EventRecord::DestroyNotify { window: e.window },
            Event::KeyPress(e) => EventRecord::KeyPress(InputRecord {
                detail: e.detail,
                state: u16::from(e.state),
                window: e.event,
                root: e.root,
                child: e.child,
                time: e.time,
                root_x: e.root_x,
                root_y: e.root_y,
                event_x: e.event_x,
                event_y: e.event_y,
            }),
            Event::ButtonPress(e) => EventRecord::ButtonPress(pointer_input(&e)),
            Event::ButtonRelease(e) => EventRecord::ButtonRelease(pointer_input(&e)),
            Event::MotionNotify(e) => EventRecord::MotionNotify(InputRecord {
                detail: u8::from(e.detail),
                state: u16::from(e.state),
                window: e.event,
                root: e.root,
                child: e.child,
                time: e.time,
                root_x: e.root_x,
                root_y: e.root_y,
                event_x: e.event_x,
                event_y: e.event_y,
            }),
            // The top bit marks client-synthesized events; X errors arrive
            // with a zero response type.
            other => EventRecord::Unknown(other.raw_response_type() & 0x7f),
        }
    }
}

fn pointer_input(e: &ButtonPressEvent) -> InputRecord {
    InputRecord {
        detail: e.detail,
        state: u16::from(e.state),
        window: e.event,
        root: e.root,
        child: e.child,
        time: e.time,
        root_x: e.root_x,
        root_y: e.root_y,
        event_x: e.event_x,
        event_y: e.event_y,
    }
}

/// The run state of the event loop, checked once per iteration.
#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Something that can block until the next event arrives.
pub trait EventSource {
    /// Block for the next event; `None` means the source is gone.
    fn next_event(&self) -> Option<EventRecord>;
}

/// Why [`pump`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The run flag was cleared.
    Stopped,
    /// The source returned `None`; the flag is left as-is for the caller.
    SourceClosed,
}

/// The cooperative event loop: while the flag is set, block for an event
/// and hand it to `handle`. A dead source ends the loop immediately and is
/// reported to the caller through [`PumpEnd::SourceClosed`].
///
/// Stopping the flag does not interrupt a blocking receive; it is observed
/// only between events, so the loop returns after one more event arrives.
pub fn pump<S, F>(run: &RunFlag, source: &S, mut handle: F) -> PumpEnd
where
    S: EventSource,
    F: FnMut(EventRecord),
{
    while run.is_running() {
        match source.next_event() {
            Some(record) => handle(record),
            None => return PumpEnd::SourceClosed,
        }
    }
    PumpEnd::Stopped
}

/// Route one decoded event. Per-event failures bubble up to the caller,
/// which logs and continues; nothing here is fatal.
pub fn dispatch(
    session: &DisplaySession,
    registry: &mut WindowRegistry,
    keyboard: &Keyboard,
    launcher: &mut Launcher,
    record: EventRecord,
) -> Result<()> {
    match record {
        EventRecord::KeyPress(key) => handle_key_press(session, registry, keyboard, launcher, &key),
        other => route_window_event(session, registry, other),
    }
}

/// The window-side half of [`dispatch`]: everything except key presses,
/// which need the launcher and shortcut table.
pub fn route_window_event<S: WindowServer>(
    server: &S,
    registry: &mut WindowRegistry,
    record: EventRecord,
) -> Result<()> {
    match record {
        EventRecord::MapRequest { window } => handle_map_request(server, registry, window),
        EventRecord::ConfigureRequest(request) => handle_configure_request(server, &request),
        EventRecord::UnmapNotify { window } => {
            match registry.remove(window) {
                Some(entity) => {
                    debug!(window, mapped = entity.mapped, "managed window unmapped, releasing entry");
                    entity.release(server);
                }
                None => debug!(window, "unmap notify for unmanaged window"),
            }
            Ok(())
        }
        EventRecord::DestroyNotify { window } => {
            match registry.remove(window) {
                Some(entity) => {
                    debug!(window, "managed window destroyed, dropping entry");
                    entity.forget();
                }
                None => debug!(window, "destroy notify for unmanaged window"),
            }
            Ok(())
        }
        EventRecord::ButtonPress(button) => handle_button_press(server, registry, &button),
        EventRecord::ButtonRelease(button) => {
            debug!(
                button = button.detail,
                window = button.window,
                "button released"
            );
            Ok(())
        }
        EventRecord::MotionNotify(motion) => {
            // Pure pointer movement is far too chatty; only drags matter.
            if motion.state & BUTTON_HELD_MASK != 0 {
                debug!(
                    window = motion.window,
                    root_x = motion.root_x,
                    root_y = motion.root_y,
                    event_x = motion.event_x,
                    event_y = motion.event_y,
                    "pointer dragged"
                );
            }
            Ok(())
        }
        // Key presses belong to the dispatcher, which owns the launcher.
        EventRecord::KeyPress(_) => Ok(()),
        EventRecord::Unknown(code) => {
            debug!(code, "unhandled event type");
            Ok(())
        }
    }
}

fn handle_map_request<S: WindowServer>(
    server: &S,
    registry: &mut WindowRegistry,
    window: u32,
) -> Result<()> {
    debug!(window, "map request");

    if server.should_manage(window) {
        let name = server.window_name(window);
        let mut entity = WindowEntity::adopt(window);
        match entity.query_geometry(server) {
            Ok(geometry) => entity.geometry = geometry,
            Err(err) => debug!(window, %err, "geometry unavailable for new window"),
        }
        entity.set_border_width(server, MANAGED_BORDER_WIDTH)?;
        entity.set_border_color(server, ACCENT_BORDER_COLOR)?;
        entity.map(server)?;
        entity.focus(server)?;
        info!(window, name = %name, border = entity.border_color, "managing new window");

        if let Some(displaced) = registry.insert(entity) {
            warn!(window, "replaced a stale registry entry");
            displaced.release(server);
        }
        registry.set_focused(Some(window));
    } else {
        // Not ours to manage; honor the map request as-is.
        server.map_window(window)?;
        debug!(window, "window mapped but not managed");
    }
    Ok(())
}

fn handle_configure_request<S: WindowServer>(
    server: &S,
    request: &ConfigureRequestRecord,
) -> Result<()> {
    debug!(
        window = request.window,
        mask = request.value_mask,
        "configure request"
    );
    server.configure_window(request.window, &request.to_aux())?;
    Ok(())
}

fn handle_key_press(
    session: &DisplaySession,
    registry: &WindowRegistry,
    keyboard: &Keyboard,
    launcher: &mut Launcher,
    key: &InputRecord,
) -> Result<()> {
    debug!(
        keycode = key.detail,
        state = key.state,
        window = key.window,
        root = key.root,
        time = key.time,
        root_x = key.root_x,
        root_y = key.root_y,
        event_x = key.event_x,
        event_y = key.event_y,
        "key press"
    );

    match launcher.handle_key_press(session, key)? {
        LauncherReply::Execute(command) => {
            launcher::launch_detached(session, &command);
        }
        LauncherReply::Consumed => {}
        LauncherReply::Ignored => match keyboard.resolve(key) {
            Some(KeyAction::ShowLauncher) => launcher.show(session)?,
            Some(action) => {
                // Advisory only; the bound window operations are not wired
                // up yet.
                info!(?action, focused = ?registry.focused(), "shortcut pressed");
            }
            None => {}
        },
    }
    Ok(())
}

fn handle_button_press<S: WindowServer>(
    server: &S,
    registry: &mut WindowRegistry,
    button: &InputRecord,
) -> Result<()> {
    debug!(
        button = button.detail,
        state = button.state,
        window = button.window,
        child = button.child,
        "button press"
    );

    if button.detail != 1 {
        info!(
            button = button.detail,
            window = button.window,
            "button press ignored"
        );
        return Ok(());
    }

    // Primary button: focus the clicked window and restack it on top.
    if let Some(entity) = registry.get(button.window) {
        entity.focus(server)?;
        registry.set_focused(Some(button.window));
    } else {
        server.focus_input(button.window)?;
        server.configure_window(
            button.window,
            &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
        )?;
        debug!(window = button.window, "raised unmanaged window");
    }
    Ok(())
}
