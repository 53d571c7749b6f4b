//! The Alt+F2 run dialog.
//!
//! A single persistent window, created hidden at startup and mapped on
//! demand. While visible it consumes key presses into a command buffer;
//! Return hands the buffer back to the dispatcher for execution, Escape
//! discards it. Text entry uses a fixed keycode table good enough for a
//! US layout command line.

use std::ffi::CString;

use anyhow::{Context, Result};
use nix::unistd::{ForkResult, execv, fork, setsid};
use tracing::{debug, error, info};
use x11rb::protocol::xproto::*;
use x11rb::wrapper::ConnectionExt as _;

use crate::events::InputRecord;
use crate::session::DisplaySession;
use crate::window::WindowEntity;

const LAUNCHER_X: i16 = 100;
const LAUNCHER_Y: i16 = 100;
const LAUNCHER_WIDTH: u16 = 400;
const LAUNCHER_HEIGHT: u16 = 50;
const LAUNCHER_BORDER: u16 = 1;
const LAUNCHER_TITLE: &str = "Run Command";
const PROMPT: &str = "Run: ";

const KEYCODE_RETURN: u8 = 36;
const KEYCODE_ESCAPE: u8 = 9;
const KEYCODE_BACKSPACE: u8 = 22;

/// What the launcher did with a key press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherReply {
    /// Not for the launcher; let the shortcut table have it.
    Ignored,
    /// Handled internally.
    Consumed,
    /// Return was pressed on a non-empty buffer; run this.
    Execute(String),
}

/// A key press seen while the dialog is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputAction {
    Submit,
    Cancel,
    Erase,
    Insert(char),
    Pass,
}

fn classify_key(keycode: u8) -> InputAction {
    match keycode {
        KEYCODE_RETURN => InputAction::Submit,
        KEYCODE_ESCAPE => InputAction::Cancel,
        KEYCODE_BACKSPACE => InputAction::Erase,
        other => match keycode_to_char(other) {
            Some(c) => InputAction::Insert(c),
            None => InputAction::Pass,
        },
    }
}

/// Fixed keycode-to-character table covering digits, letters, and space.
/// Keycodes outside it are passed through untouched.
fn keycode_to_char(keycode: u8) -> Option<char> {
    match keycode {
        // Digit row: 1 through 9, then 0.
        10..=19 => Some((b'0' + (keycode - 10 + 1) % 10) as char),
        // The three letter rows, in row order.
        24..=33 => Some((b'a' + (keycode - 24)) as char),
        38..=46 => Some((b'a' + (keycode - 38 + 10)) as char),
        52..=58 => Some((b'a' + (keycode - 52 + 19)) as char),
        65 => Some(' '),
        _ => None,
    }
}

/// The run dialog window and its edit state. The window is created once,
/// unmapped, and lives for the whole session.
pub struct Launcher {
    window: WindowEntity,
    command: String,
}

impl Launcher {
    pub fn new(session: &DisplaySession) -> Result<Self> {
        let window = WindowEntity::create(
            session,
            LAUNCHER_X,
            LAUNCHER_Y,
            LAUNCHER_WIDTH,
            LAUNCHER_HEIGHT,
            LAUNCHER_BORDER,
        )
        .context("failed to create the launcher window")?;

        session.handle()?.change_property8(
            PropMode::REPLACE,
            window.id,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            LAUNCHER_TITLE.as_bytes(),
        )?;
        session.flush()?;

        debug!(window = window.id, "launcher window created");
        Ok(Self {
            window,
            command: String::new(),
        })
    }

    pub fn is_visible(&self) -> bool {
        self.window.mapped
    }

    /// Map the dialog with an empty buffer, focus it, and raise it.
    pub fn show(&mut self, session: &DisplaySession) -> Result<()> {
        if self.window.mapped {
            return Ok(());
        }
        self.command.clear();

        self.window.map(session)?;
        self.window.focus(session)?;

        self.draw(session)?;
        info!("launcher shown");
        Ok(())
    }

    pub fn hide(&mut self, session: &DisplaySession) -> Result<()> {
        if !self.window.mapped {
            return Ok(());
        }
        self.window.unmap(session)?;
        info!("launcher hidden");
        Ok(())
    }

    /// Feed one key press through the dialog. Presses for other windows,
    /// or while hidden, come back as [`LauncherReply::Ignored`].
    pub fn handle_key_press(
        &mut self,
        session: &DisplaySession,
        key: &InputRecord,
    ) -> Result<LauncherReply> {
        if !self.window.mapped || key.window != self.window.id {
            return Ok(LauncherReply::Ignored);
        }

        match classify_key(key.detail) {
            InputAction::Submit => {
                let command = std::mem::take(&mut self.command);
                self.hide(session)?;
                if command.is_empty() {
                    Ok(LauncherReply::Consumed)
                } else {
                    Ok(LauncherReply::Execute(command))
                }
            }
            InputAction::Cancel => {
                self.hide(session)?;
                Ok(LauncherReply::Consumed)
            }
            InputAction::Erase => {
                if self.command.pop().is_some() {
                    self.draw(session)?;
                }
                Ok(LauncherReply::Consumed)
            }
            InputAction::Insert(c) => {
                self.command.push(c);
                self.draw(session)?;
                Ok(LauncherReply::Consumed)
            }
            InputAction::Pass => Ok(LauncherReply::Ignored),
        }
    }

    /// Redraw the prompt and buffer. A throwaway graphics context per draw
    /// is fine at interactive key rates.
    pub fn draw(&self, session: &DisplaySession) -> Result<()> {
        if !self.window.mapped {
            return Ok(());
        }
        let conn = session.handle()?;
        let screen = *session.screen();

        conn.clear_area(false, self.window.id, 0, 0, 0, 0)?;

        let gc = session.generate_id()?;
        conn.create_gc(
            gc,
            self.window.id,
            &CreateGCAux::new()
                .foreground(screen.black_pixel)
                .background(screen.white_pixel),
        )?;

        let text = format!("{PROMPT}{}", self.command);
        conn.image_text8(self.window.id, gc, 10, 20, text.as_bytes())?;
        conn.free_gc(gc)?;
        session.flush()?;
        Ok(())
    }

    /// Destroy the dialog window at teardown. Consumes the launcher.
    pub fn destroy(self, session: &DisplaySession) {
        self.window.release(session);
    }
}

/// Fork and run `command` through `/bin/sh -c`, fully detached: the child
/// gets its own session and closes the inherited X connection before the
/// exec. The parent never waits.
pub fn launch_detached(session: &DisplaySession, command: &str) {
    info!(command, "executing command");

    let (program, args) = match shell_argv(command) {
        Ok(pair) => pair,
        Err(err) => {
            error!(command, %err, "command is not executable");
            return;
        }
    };
    let x_fd = session.raw_fd();

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Only async-signal-safe calls from here to the exec.
            if let Some(fd) = x_fd {
                unsafe { libc::close(fd) };
            }
            let _ = setsid();
            let _ = execv(&program, &args);
            unsafe { libc::_exit(1) };
        }
        Ok(ForkResult::Parent { child }) => {
            debug!(command, pid = child.as_raw(), "launched command");
        }
        Err(err) => {
            error!(command, %err, "failed to fork for command");
        }
    }
}

fn shell_argv(command: &str) -> Result<(CString, [CString; 3])> {
    let program = CString::new("/bin/sh")?;
    let args = [
        CString::new("sh")?,
        CString::new("-c")?,
        CString::new(command).context("command contains an interior NUL")?,
    ];
    Ok((program, args))
}
