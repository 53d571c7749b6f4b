//! Global keyboard shortcuts.
//!
//! Bindings are declared by keysym and resolved to keycodes against the
//! server's keyboard mapping at startup, so they survive non-default
//! layouts. Each grab is repeated with the NumLock and CapsLock variants
//! and the lock bits are masked back off on lookup.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;

use crate::events::InputRecord;
use crate::session::DisplaySession;

const XK_TAB: u32 = 0xFF09;
const XK_F1: u32 = 0xFFBE;
const XK_F2: u32 = 0xFFBF;
const XK_F4: u32 = 0xFFC1;
const XK_SPACE: u32 = 0x0020;

pub const MOD_CAPSLOCK: u16 = 0x0002;
pub const MOD_ALT: u16 = 0x0008;
pub const MOD_NUMLOCK: u16 = 0x0010;

/// What a grabbed shortcut means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAction {
    CycleWindows,
    CloseWindow,
    ShowLauncher,
    WindowMenu,
    MainMenu,
}

/// The built-in shortcut table, all on the Alt (Mod1) modifier.
const DEFAULT_BINDINGS: &[(u32, u16, KeyAction)] = &[
    (XK_TAB, MOD_ALT, KeyAction::CycleWindows),
    (XK_F4, MOD_ALT, KeyAction::CloseWindow),
    (XK_F2, MOD_ALT, KeyAction::ShowLauncher),
    (XK_SPACE, MOD_ALT, KeyAction::WindowMenu),
    (XK_F1, MOD_ALT, KeyAction::MainMenu),
];

/// Resolved shortcut table, keyed by keycode and base modifier mask.
pub struct Keyboard {
    bindings: HashMap<(u8, u16), KeyAction>,
}

impl Keyboard {
    /// Fetch the keyboard mapping and resolve the built-in bindings.
    pub fn new(session: &DisplaySession) -> Result<Self> {
        let conn = session.handle()?;
        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let count = setup.max_keycode - min_keycode + 1;

        let mapping = conn
            .get_keyboard_mapping(min_keycode, count)?
            .reply()
            .context("failed to fetch the keyboard mapping")?;

        let table = keysym_table(min_keycode, mapping.keysyms_per_keycode, &mapping.keysyms);
        Ok(Self::from_keysym_table(&table))
    }

    /// Resolve the built-in bindings against a keysym-to-keycode table.
    pub fn from_keysym_table(table: &HashMap<u32, u8>) -> Self {
        let mut bindings = HashMap::new();
        for &(keysym, modifiers, action) in DEFAULT_BINDINGS {
            match table.get(&keysym) {
                Some(&keycode) => {
                    debug!(keycode, modifiers, ?action, "resolved key binding");
                    bindings.insert((keycode, modifiers), action);
                }
                None => warn!(keysym, ?action, "no keycode for binding, skipping it"),
            }
        }
        Self { bindings }
    }

    /// Grab every resolved binding on the root window, with the NumLock
    /// and CapsLock variants so the shortcuts fire regardless of lock
    /// state.
    pub fn grab_wm_keys(&self, session: &DisplaySession) -> Result<()> {
        debug!(count = self.bindings.len(), "grabbing window management keys");
        let conn = session.handle()?;
        let root = session.screen().root;

        for &(keycode, modifiers) in self.bindings.keys() {
            for extra in [0, MOD_NUMLOCK, MOD_CAPSLOCK, MOD_NUMLOCK | MOD_CAPSLOCK] {
                conn.grab_key(
                    true,
                    root,
                    ModMask::from(modifiers | extra),
                    keycode,
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                )?;
            }
        }
        session.flush()?;
        Ok(())
    }

    /// Look up the action for a key press, ignoring lock-state bits.
    pub fn resolve(&self, key: &InputRecord) -> Option<KeyAction> {
        let modifiers = key.state & 0xFF & !(MOD_NUMLOCK | MOD_CAPSLOCK);
        self.bindings.get(&(key.detail, modifiers)).copied()
    }
}

/// Build a keysym-to-keycode table from a raw keyboard mapping. The first
/// keycode carrying a keysym wins, matching server-side lookup order.
pub fn keysym_table(min_keycode: u8, keysyms_per_keycode: u8, keysyms: &[u32]) -> HashMap<u32, u8> {
    let mut table = HashMap::new();
    for (i, chunk) in keysyms.chunks(keysyms_per_keycode.max(1) as usize).enumerate() {
        for &keysym in chunk {
            if keysym != 0 {
                table.entry(keysym).or_insert(min_keycode + i as u8);
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(detail: u8, state: u16) -> InputRecord {
        InputRecord {
            detail,
            state,
            window: 1,
            root: 1,
            child: 0,
            time: 0,
            root_x: 0,
            root_y: 0,
            event_x: 0,
            event_y: 0,
        }
    }

    fn test_table() -> HashMap<u32, u8> {
        // Keycodes from a typical pc105 layout.
        HashMap::from([
            (XK_TAB, 23),
            (XK_F1, 67),
            (XK_F2, 68),
            (XK_F4, 70),
            (XK_SPACE, 65),
        ])
    }

    #[test]
    fn resolves_bound_shortcuts() {
        let keyboard = Keyboard::from_keysym_table(&test_table());
        assert_eq!(keyboard.resolve(&key(23, MOD_ALT)), Some(KeyAction::CycleWindows));
        assert_eq!(keyboard.resolve(&key(70, MOD_ALT)), Some(KeyAction::CloseWindow));
        assert_eq!(keyboard.resolve(&key(68, MOD_ALT)), Some(KeyAction::ShowLauncher));
        assert_eq!(keyboard.resolve(&key(65, MOD_ALT)), Some(KeyAction::WindowMenu));
        assert_eq!(keyboard.resolve(&key(67, MOD_ALT)), Some(KeyAction::MainMenu));
    }

    #[test]
    fn unbound_keys_resolve_to_nothing() {
        let keyboard = Keyboard::from_keysym_table(&test_table());
        assert_eq!(keyboard.resolve(&key(23, 0)), None);
        assert_eq!(keyboard.resolve(&key(24, MOD_ALT)), None);
    }

    #[test]
    fn lock_modifiers_are_ignored_on_lookup() {
        let keyboard = Keyboard::from_keysym_table(&test_table());
        for extra in [MOD_NUMLOCK, MOD_CAPSLOCK, MOD_NUMLOCK | MOD_CAPSLOCK] {
            assert_eq!(
                keyboard.resolve(&key(23, MOD_ALT | extra)),
                Some(KeyAction::CycleWindows)
            );
        }
    }

    #[test]
    fn missing_keysyms_are_skipped() {
        let mut table = test_table();
        table.remove(&XK_TAB);
        let keyboard = Keyboard::from_keysym_table(&table);
        assert_eq!(keyboard.resolve(&key(23, MOD_ALT)), None);
        assert_eq!(keyboard.resolve(&key(70, MOD_ALT)), Some(KeyAction::CloseWindow));
    }

    #[test]
    fn keysym_table_prefers_the_lowest_keycode() {
        // Keycode 8 and 9 both carry keysym 0x61; the first one wins.
        let keysyms = [0x61, 0, 0x61, 0x41, 0, 0, 0x62, 0];
        let table = keysym_table(8, 2, &keysyms);
        assert_eq!(table.get(&0x61), Some(&8));
        assert_eq!(table.get(&0x41), Some(&9));
        assert_eq!(table.get(&0x62), Some(&11));
        assert_eq!(table.get(&0), None);
    }
}
