//! X server session management.
//!
//! Owns the connection, the screen descriptor captured at connect time, and
//! the resource-id allocator. All mutating requests are buffered by x11rb
//! until [`DisplaySession::flush`] pushes them to the server.

use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;

use crate::events::{EventRecord, EventSource};
use crate::window::{Geometry, WindowServer, manage_policy};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to X server: {0}")]
    Refused(#[from] x11rb::errors::ConnectError),
    #[error("screen {0} is not available")]
    ScreenUnavailable(usize),
    #[error("protocol error: {0}")]
    Protocol(#[from] x11rb::errors::ConnectionError),
    #[error("session is closed")]
    Closed,
}

/// Screen descriptor, copied out of the connection setup so it stays
/// available without borrowing the connection.
#[derive(Debug, Clone, Copy)]
pub struct ScreenInfo {
    pub root: u32,
    pub width: u16,
    pub height: u16,
    pub root_visual: u32,
    pub root_depth: u8,
    pub black_pixel: u32,
    pub white_pixel: u32,
}

/// A live session with the X server. One per process; closing is idempotent.
pub struct DisplaySession {
    conn: Option<RustConnection>,
    screen: ScreenInfo,
}

impl DisplaySession {
    /// Connect to the X server. `None` uses `$DISPLAY`.
    pub fn connect(display_name: Option<&str>) -> Result<Self, SessionError> {
        debug!(display = ?display_name, "connecting to X server");

        let (conn, screen_num) = RustConnection::connect(display_name)?;
        let setup = conn.setup();
        let screen = setup
            .roots
            .get(screen_num)
            .ok_or(SessionError::ScreenUnavailable(screen_num))?;

        let screen = ScreenInfo {
            root: screen.root,
            width: screen.width_in_pixels,
            height: screen.height_in_pixels,
            root_visual: screen.root_visual,
            root_depth: screen.root_depth,
            black_pixel: screen.black_pixel,
            white_pixel: screen.white_pixel,
        };

        info!(
            screen = screen_num,
            width = screen.width,
            height = screen.height,
            "connected to X server"
        );

        Ok(Self {
            conn: Some(conn),
            screen,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.conn.is_some()
    }

    pub fn screen(&self) -> &ScreenInfo {
        &self.screen
    }

    /// The underlying connection; fails once the session has been closed.
    pub fn handle(&self) -> Result<&RustConnection, SessionError> {
        self.conn.as_ref().ok_or(SessionError::Closed)
    }

    /// Allocate a fresh resource id. Ids are monotonic and never reused
    /// within a session.
    pub fn generate_id(&self) -> Result<u32> {
        Ok(self.handle()?.generate_id()?)
    }

    /// Push all buffered requests to the server.
    pub fn flush(&self) -> Result<(), SessionError> {
        self.handle()?.flush()?;
        Ok(())
    }

    /// Best-effort WM_NAME lookup; empty string if the property is absent
    /// or the reply fails.
    pub fn window_name(&self, window: u32) -> String {
        let reply = self
            .handle()
            .ok()
            .and_then(|conn| {
                conn.get_property(false, window, AtomEnum::WM_NAME, AtomEnum::STRING, 0, 1024)
                    .ok()
            })
            .and_then(|cookie| cookie.reply().ok());

        match reply {
            Some(reply) if reply.format == 8 && reply.type_ == u32::from(AtomEnum::STRING) => {
                String::from_utf8_lossy(&reply.value).into_owned()
            }
            _ => {
                debug!(window, "WM_NAME unavailable");
                String::new()
            }
        }
    }

    /// Best-effort WM_CLASS lookup. The raw property value is returned as a
    /// single string (instance and class separated by NUL), which is all the
    /// manage policy needs for its substring checks.
    pub fn wm_class(&self, window: u32) -> Option<String> {
        let reply = self
            .handle()
            .ok()?
            .get_property(false, window, AtomEnum::WM_CLASS, AtomEnum::STRING, 0, 1024)
            .ok()?
            .reply()
            .ok()?;

        if reply.format == 8 && reply.type_ == u32::from(AtomEnum::STRING) {
            Some(String::from_utf8_lossy(&reply.value).into_owned())
        } else {
            None
        }
    }

    /// The transport file descriptor, for closing in a forked child.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(|conn| conn.stream().as_raw_fd())
    }

    /// Drop the connection. Safe to call more than once; after the first
    /// call every request path reports [`SessionError::Closed`].
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!("disconnecting from X server");
        }
    }
}

/// The live implementation of the window-management seam. Every request
/// is flushed immediately; x11rb otherwise buffers until the next read.
impl WindowServer for DisplaySession {
    fn map_window(&self, window: u32) -> Result<()> {
        self.handle()?.map_window(window)?;
        self.flush()?;
        Ok(())
    }

    fn unmap_window(&self, window: u32) -> Result<()> {
        self.handle()?.unmap_window(window)?;
        self.flush()?;
        Ok(())
    }

    fn configure_window(&self, window: u32, aux: &ConfigureWindowAux) -> Result<()> {
        self.handle()?.configure_window(window, aux)?;
        self.flush()?;
        Ok(())
    }

    fn set_border_pixel(&self, window: u32, color: u32) -> Result<()> {
        let aux = ChangeWindowAttributesAux::new().border_pixel(color);
        self.handle()?.change_window_attributes(window, &aux)?;
        self.flush()?;
        Ok(())
    }

    fn focus_input(&self, window: u32) -> Result<()> {
        self.handle()?
            .set_input_focus(InputFocus::POINTER_ROOT, window, x11rb::CURRENT_TIME)?;
        self.flush()?;
        Ok(())
    }

    fn destroy_window(&self, window: u32) -> Result<()> {
        self.handle()?.destroy_window(window)?;
        self.flush()?;
        Ok(())
    }

    fn window_geometry(&self, window: u32) -> Result<Geometry> {
        let reply = self.handle()?.get_geometry(window)?.reply()?;
        Ok(Geometry {
            x: reply.x,
            y: reply.y,
            width: reply.width,
            height: reply.height,
            border_width: reply.border_width,
        })
    }

    /// Manage decision for one window: attributes first (unreadable means
    /// no), then the pure policy over override-redirect, viewability, and
    /// WM_CLASS.
    fn should_manage(&self, window: u32) -> bool {
        let attributes = self
            .handle()
            .ok()
            .and_then(|conn| conn.get_window_attributes(window).ok())
            .and_then(|cookie| cookie.reply().ok());
        let Some(attributes) = attributes else {
            warn!(window, "window attributes unavailable, not managing");
            return false;
        };

        let viewable = attributes.map_state == MapState::VIEWABLE;
        let class = self.wm_class(window);
        manage_policy(attributes.override_redirect, viewable, class.as_deref())
    }

    fn window_name(&self, window: u32) -> String {
        DisplaySession::window_name(self, window)
    }
}

impl EventSource for DisplaySession {
    /// Block until the next protocol event arrives. `None` means the
    /// connection is gone and no event was dispatched.
    fn next_event(&self) -> Option<EventRecord> {
        let conn = self.conn.as_ref()?;
        match conn.wait_for_event() {
            Ok(event) => Some(EventRecord::from(event)),
            Err(err) => {
                warn!(%err, "failed to read the next event, connection might be broken");
                None
            }
        }
    }
}
