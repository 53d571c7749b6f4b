//! slatewm
//!
//! A minimal floating X11 window manager: it claims substructure
//! redirection on the root window, frames and focuses client windows, and
//! offers an Alt+F2 run dialog.

pub mod events;
pub mod keyboard;
pub mod launcher;
pub mod session;
pub mod window;
pub mod wm;
