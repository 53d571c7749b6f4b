//! The window manager itself: claims the root window, adopts existing
//! clients, and drives the event loop.

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};
use x11rb::protocol::ErrorKind;
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;

use crate::events::{self, PumpEnd, RunFlag, pump};
use crate::keyboard::Keyboard;
use crate::launcher::Launcher;
use crate::session::DisplaySession;
use crate::window::{
    ACCENT_BORDER_COLOR, MANAGED_BORDER_WIDTH, WindowEntity, WindowRegistry, WindowServer,
};

#[derive(Debug, Error)]
pub enum WmError {
    #[error("another window manager is already running")]
    AlreadyRunning,
}

/// Everything the running window manager owns. Dropping it tears nothing
/// down; call [`Wm::teardown`] to release resources in order.
pub struct Wm {
    session: DisplaySession,
    root: WindowEntity,
    registry: WindowRegistry,
    keyboard: Keyboard,
    launcher: Launcher,
    run: RunFlag,
}

impl Wm {
    /// Connect, claim window-manager rights on the root window, grab the
    /// shortcut keys, adopt existing clients, and create the launcher.
    ///
    /// Fails with [`WmError::AlreadyRunning`] when another client already
    /// holds substructure redirection on this display.
    pub fn initialize(display_name: Option<&str>) -> Result<Self> {
        debug!("initializing the window manager");

        let session = DisplaySession::connect(display_name)?;
        debug!(alive = session.is_alive(), "session established");

        let root = WindowEntity::adopt(session.screen().root);
        let keyboard = Keyboard::new(&session)?;

        claim_wm_rights(&session, root.id)?;
        keyboard.grab_wm_keys(&session)?;

        let mut registry = WindowRegistry::new();
        scan_existing_windows(&session, root.id, &mut registry)?;

        let launcher = Launcher::new(&session)?;

        info!(managed = registry.len(), "window manager initialized");
        Ok(Self {
            session,
            root,
            registry,
            keyboard,
            launcher,
            run: RunFlag::new(),
        })
    }

    /// Block on the event loop until the run flag clears or the connection
    /// dies. Per-event failures are logged and the loop keeps going.
    pub fn run(&mut self) {
        info!("starting main event loop");
        self.run.start();

        let run = self.run.clone();
        let end = {
            let session = &self.session;
            let registry = &mut self.registry;
            let keyboard = &self.keyboard;
            let launcher = &mut self.launcher;

            pump(&run, session, |record| {
                if let Err(err) = events::dispatch(session, registry, keyboard, launcher, record) {
                    warn!(%err, "failed to handle event");
                }
            })
        };

        if end == PumpEnd::SourceClosed {
            warn!("connection to the X server is gone");
            self.terminate();
        }
        info!("main event loop terminated");
    }

    /// Ask the event loop to stop. The loop only checks the flag between
    /// events, so it exits after the next event arrives.
    pub fn terminate(&self) {
        info!("terminating window manager");
        self.run.stop();
    }

    /// Release everything in reverse order of acquisition: the launcher
    /// window, the managed entities, the root entity, then the connection.
    /// Client windows are adopted, so releasing them issues no destroy.
    pub fn teardown(mut self) {
        debug!("tearing down the window manager");
        self.run.stop();

        self.launcher.destroy(&self.session);

        for entity in self.registry.drain() {
            entity.release(&self.session);
        }
        self.root.release(&self.session);

        self.session.close();
    }
}

/// Select the substructure-redirect mask on the root window. The X server
/// grants it to at most one client, which is what makes us the window
/// manager.
fn claim_wm_rights(session: &DisplaySession, root: u32) -> Result<()> {
    debug!("claiming window manager rights on the root window");
    let conn = session.handle()?;

    let aux = ChangeWindowAttributesAux::new().event_mask(
        EventMask::SUBSTRUCTURE_REDIRECT
            | EventMask::SUBSTRUCTURE_NOTIFY
            | EventMask::PROPERTY_CHANGE
            | EventMask::KEY_PRESS,
    );

    if let Err(err) = conn.change_window_attributes(root, &aux)?.check() {
        if let x11rb::errors::ReplyError::X11Error(ref e) = err {
            if e.error_kind == ErrorKind::Access {
                return Err(WmError::AlreadyRunning.into());
            }
        }
        return Err(err).context("failed to select events on the root window");
    }
    session.flush()?;
    Ok(())
}

/// Adopt clients that were mapped before we started, so a restart does not
/// orphan them.
fn scan_existing_windows(
    session: &DisplaySession,
    root: u32,
    registry: &mut WindowRegistry,
) -> Result<()> {
    debug!("scanning for existing windows");
    let conn: &RustConnection = session.handle()?;

    let reply = match conn.query_tree(root)?.reply() {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%err, "failed to query existing windows");
            return Ok(());
        }
    };

    info!(count = reply.children.len(), "found existing windows");

    for &child in &reply.children {
        if !session.should_manage(child) {
            continue;
        }

        let mut entity = WindowEntity::adopt(child);
        match entity.query_geometry(session) {
            Ok(geometry) => entity.geometry = geometry,
            Err(err) => debug!(window = child, %err, "geometry unavailable for existing window"),
        }
        entity.set_border_width(session, MANAGED_BORDER_WIDTH)?;
        entity.set_border_color(session, ACCENT_BORDER_COLOR)?;
        entity.map(session)?;

        debug!(window = child, "managing existing window");
        if let Some(displaced) = registry.insert(entity) {
            displaced.release(session);
        }
    }
    Ok(())
}
