//! Window entities and the managed-window registry.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use x11rb::protocol::xproto::*;

use crate::session::DisplaySession;

/// Border color applied to freshly created windows.
const DEFAULT_BORDER_COLOR: u32 = 0x000000;

/// Border width applied to managed windows.
pub const MANAGED_BORDER_WIDTH: u16 = 2;

/// Accent border color applied to managed windows.
pub const ACCENT_BORDER_COLOR: u32 = 0x3388FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
}

/// The server-side operations window management issues. [`DisplaySession`]
/// implements it over the live connection, flushing after each request;
/// tests substitute a recording fake.
pub trait WindowServer {
    fn map_window(&self, window: u32) -> Result<()>;
    fn unmap_window(&self, window: u32) -> Result<()>;
    fn configure_window(&self, window: u32, aux: &ConfigureWindowAux) -> Result<()>;
    fn set_border_pixel(&self, window: u32, color: u32) -> Result<()>;
    fn focus_input(&self, window: u32) -> Result<()>;
    fn destroy_window(&self, window: u32) -> Result<()>;
    fn window_geometry(&self, window: u32) -> Result<Geometry>;
    /// Whether this window should come under management at all.
    fn should_manage(&self, window: u32) -> bool;
    /// Best-effort WM_NAME lookup; empty when unavailable.
    fn window_name(&self, window: u32) -> String;
}

/// One window, either adopted from the server or created by us.
///
/// `owned` decides the release behavior: a created window is destroyed on
/// release, an adopted one is left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntity {
    pub id: u32,
    pub geometry: Geometry,
    pub mapped: bool,
    pub border_color: u32,
    pub owned: bool,
}

impl WindowEntity {
    /// Wrap a window that already exists on the server. No request is
    /// issued; releasing the entity never destroys the underlying window.
    pub fn adopt(id: u32) -> Self {
        Self {
            id,
            geometry: Geometry::default(),
            mapped: false,
            border_color: DEFAULT_BORDER_COLOR,
            owned: false,
        }
    }

    /// Create a new top-level window and take ownership of it.
    pub fn create(
        session: &DisplaySession,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
        border_width: u16,
    ) -> Result<Self> {
        let conn = session.handle()?;
        let screen = session.screen();
        let id = session.generate_id()?;

        let aux = CreateWindowAux::new()
            .background_pixel(screen.white_pixel)
            .event_mask(
                EventMask::EXPOSURE
                    | EventMask::KEY_PRESS
                    | EventMask::BUTTON_PRESS
                    | EventMask::BUTTON_RELEASE
                    | EventMask::POINTER_MOTION
                    | EventMask::STRUCTURE_NOTIFY,
            );

        conn.create_window(
            screen.root_depth,
            id,
            screen.root,
            x,
            y,
            width,
            height,
            border_width,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &aux,
        )
        .context("create_window request failed")?;

        debug!(window = id, "created new window");

        let mut entity = Self {
            id,
            geometry: Geometry {
                x,
                y,
                width,
                height,
                border_width,
            },
            mapped: false,
            border_color: DEFAULT_BORDER_COLOR,
            owned: true,
        };
        entity.set_border_color(session, DEFAULT_BORDER_COLOR)?;
        Ok(entity)
    }

    pub fn map<S: WindowServer>(&mut self, server: &S) -> Result<()> {
        debug!(window = self.id, "mapping window");
        server.map_window(self.id)?;
        self.mapped = true;
        Ok(())
    }

    pub fn unmap<S: WindowServer>(&mut self, server: &S) -> Result<()> {
        debug!(window = self.id, "unmapping window");
        server.unmap_window(self.id)?;
        self.mapped = false;
        Ok(())
    }

    /// Reposition, resize, and restack in one request.
    pub fn configure<S: WindowServer>(
        &mut self,
        server: &S,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
        border_width: u16,
        stack_mode: StackMode,
    ) -> Result<()> {
        let aux = ConfigureWindowAux::new()
            .x(i32::from(x))
            .y(i32::from(y))
            .width(u32::from(width))
            .height(u32::from(height))
            .border_width(u32::from(border_width))
            .stack_mode(stack_mode);
        server.configure_window(self.id, &aux)?;

        self.geometry = Geometry {
            x,
            y,
            width,
            height,
            border_width,
        };
        debug!(window = self.id, x, y, width, height, border_width, "configured window");
        Ok(())
    }

    pub fn move_to<S: WindowServer>(&mut self, server: &S, x: i16, y: i16) -> Result<()> {
        let aux = ConfigureWindowAux::new().x(i32::from(x)).y(i32::from(y));
        server.configure_window(self.id, &aux)?;
        self.geometry.x = x;
        self.geometry.y = y;
        debug!(window = self.id, x, y, "moved window");
        Ok(())
    }

    pub fn resize<S: WindowServer>(&mut self, server: &S, width: u16, height: u16) -> Result<()> {
        let aux = ConfigureWindowAux::new()
            .width(u32::from(width))
            .height(u32::from(height));
        server.configure_window(self.id, &aux)?;
        self.geometry.width = width;
        self.geometry.height = height;
        debug!(window = self.id, width, height, "resized window");
        Ok(())
    }

    pub fn set_border_width<S: WindowServer>(&mut self, server: &S, width: u16) -> Result<()> {
        let aux = ConfigureWindowAux::new().border_width(u32::from(width));
        server.configure_window(self.id, &aux)?;
        self.geometry.border_width = width;
        debug!(window = self.id, width, "set border width");
        Ok(())
    }

    pub fn set_border_color<S: WindowServer>(&mut self, server: &S, color: u32) -> Result<()> {
        server.set_border_pixel(self.id, color)?;
        self.border_color = color;
        debug!(window = self.id, color, "set border color");
        Ok(())
    }

    /// Give this window input focus and bring it to the top.
    pub fn focus<S: WindowServer>(&self, server: &S) -> Result<()> {
        server.focus_input(self.id)?;
        self.raise(server)?;
        debug!(window = self.id, "focused window");
        Ok(())
    }

    pub fn raise<S: WindowServer>(&self, server: &S) -> Result<()> {
        let aux = ConfigureWindowAux::new().stack_mode(StackMode::ABOVE);
        server.configure_window(self.id, &aux)?;
        debug!(window = self.id, "raised window");
        Ok(())
    }

    pub fn lower<S: WindowServer>(&self, server: &S) -> Result<()> {
        let aux = ConfigureWindowAux::new().stack_mode(StackMode::BELOW);
        server.configure_window(self.id, &aux)?;
        debug!(window = self.id, "lowered window");
        Ok(())
    }

    /// Synchronous geometry round trip; fails if the window is gone.
    pub fn query_geometry<S: WindowServer>(&self, server: &S) -> Result<Geometry> {
        server
            .window_geometry(self.id)
            .with_context(|| format!("no geometry reply for window {}", self.id))
    }

    /// Consume the entity. An owned window is destroyed on the server; an
    /// adopted one is left untouched. Request failures are logged, not
    /// propagated, so teardown paths stay infallible.
    pub fn release<S: WindowServer>(self, server: &S) {
        if !self.owned {
            return;
        }
        debug!(window = self.id, "destroying owned window");
        if let Err(err) = server.destroy_window(self.id) {
            warn!(window = self.id, %err, "destroy request failed");
        }
    }

    /// Consume the entity without issuing any request, for windows the
    /// server has already destroyed.
    pub fn forget(self) {
        debug!(window = self.id, "dropping window entity");
    }
}

/// Pure part of the manage decision. Desktop and dock windows keep their
/// own placement; an unavailable class excludes nothing.
pub(crate) fn manage_policy(override_redirect: bool, viewable: bool, wm_class: Option<&str>) -> bool {
    if override_redirect {
        return false;
    }
    if !viewable {
        return false;
    }
    match wm_class {
        Some(class) => !(class.contains("desktop") || class.contains("dock")),
        None => true,
    }
}

/// All windows currently under management, keyed by window id.
#[derive(Debug, Default)]
pub struct WindowRegistry {
    windows: HashMap<u32, WindowEntity>,
    focused: Option<u32>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity. Returns any entity previously registered under
    /// the same id so the caller can release it.
    pub fn insert(&mut self, entity: WindowEntity) -> Option<WindowEntity> {
        self.windows.insert(entity.id, entity)
    }

    /// Remove and return the entry for `id`. A second call for the same id
    /// returns `None`.
    pub fn remove(&mut self, id: u32) -> Option<WindowEntity> {
        if self.focused == Some(id) {
            self.focused = None;
        }
        self.windows.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&WindowEntity> {
        self.windows.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.windows.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn set_focused(&mut self, id: Option<u32>) {
        self.focused = id;
    }

    pub fn focused(&self) -> Option<u32> {
        self.focused
    }

    /// Empty the registry, yielding every entity for release.
    pub fn drain(&mut self) -> impl Iterator<Item = WindowEntity> + '_ {
        self.focused = None;
        self.windows.drain().map(|(_, entity)| entity)
    }
}

/// A recording [`WindowServer`] for tests: every request is appended to a
/// log, classification and geometry replies are canned.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::HashSet;

    use anyhow::Result;
    use x11rb::protocol::xproto::ConfigureWindowAux;

    use super::{Geometry, WindowServer};

    #[derive(Debug, Clone)]
    pub(crate) enum Request {
        Map(u32),
        Unmap(u32),
        Configure(u32, ConfigureWindowAux),
        Border(u32, u32),
        Focus(u32),
        Destroy(u32),
    }

    #[derive(Default)]
    pub(crate) struct FakeServer {
        pub(crate) manageable: HashSet<u32>,
        pub(crate) geometry: Geometry,
        pub(crate) requests: RefCell<Vec<Request>>,
    }

    impl FakeServer {
        pub(crate) fn managing(windows: &[u32]) -> Self {
            Self {
                manageable: windows.iter().copied().collect(),
                ..Self::default()
            }
        }

        pub(crate) fn sent(&self) -> Vec<Request> {
            self.requests.borrow().clone()
        }
    }

    impl WindowServer for FakeServer {
        fn map_window(&self, window: u32) -> Result<()> {
            self.requests.borrow_mut().push(Request::Map(window));
            Ok(())
        }

        fn unmap_window(&self, window: u32) -> Result<()> {
            self.requests.borrow_mut().push(Request::Unmap(window));
            Ok(())
        }

        fn configure_window(&self, window: u32, aux: &ConfigureWindowAux) -> Result<()> {
            self.requests.borrow_mut().push(Request::Configure(window, aux.clone()));
            Ok(())
        }

        fn set_border_pixel(&self, window: u32, color: u32) -> Result<()> {
            self.requests.borrow_mut().push(Request::Border(window, color));
            Ok(())
        }

        fn focus_input(&self, window: u32) -> Result<()> {
            self.requests.borrow_mut().push(Request::Focus(window));
            Ok(())
        }

        fn destroy_window(&self, window: u32) -> Result<()> {
            self.requests.borrow_mut().push(Request::Destroy(window));
            Ok(())
        }

        fn window_geometry(&self, _window: u32) -> Result<Geometry> {
            Ok(self.geometry)
        }

        fn should_manage(&self, window: u32) -> bool {
            self.manageable.contains(&window)
        }

        fn window_name(&self, _window: u32) -> String {
            String::from("client")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeServer, Request};
    use super::*;
    use pretty_assertions::assert_eq;

    fn adopted(id: u32) -> WindowEntity {
        WindowEntity::adopt(id)
    }

    fn created(id: u32) -> WindowEntity {
        WindowEntity {
            id,
            geometry: Geometry::default(),
            mapped: false,
            border_color: DEFAULT_BORDER_COLOR,
            owned: true,
        }
    }

    #[test]
    fn adopted_windows_are_not_owned() {
        assert!(!adopted(42).owned);
        assert!(created(42).owned);
    }

    #[test]
    fn map_and_unmap_track_the_mapped_state() {
        let server = FakeServer::default();
        let mut entity = adopted(7);
        entity.map(&server).unwrap();
        assert!(entity.mapped);
        entity.unmap(&server).unwrap();
        assert!(!entity.mapped);
        assert!(matches!(server.sent()[..], [Request::Map(7), Request::Unmap(7)]));
    }

    #[test]
    fn configure_sends_every_field_and_updates_geometry() {
        let server = FakeServer::default();
        let mut entity = adopted(7);
        entity
            .configure(&server, 5, 6, 300, 200, 3, StackMode::ABOVE)
            .unwrap();

        assert_eq!(
            entity.geometry,
            Geometry { x: 5, y: 6, width: 300, height: 200, border_width: 3 }
        );
        match &server.sent()[..] {
            [Request::Configure(7, aux)] => {
                assert_eq!(aux.x, Some(5));
                assert_eq!(aux.y, Some(6));
                assert_eq!(aux.width, Some(300));
                assert_eq!(aux.height, Some(200));
                assert_eq!(aux.border_width, Some(3));
                assert_eq!(aux.stack_mode, Some(StackMode::ABOVE));
            }
            other => panic!("wrong requests: {other:?}"),
        }
    }

    #[test]
    fn move_to_sends_only_the_position() {
        let server = FakeServer::default();
        let mut entity = adopted(7);
        entity.geometry = Geometry { x: 0, y: 0, width: 640, height: 480, border_width: 2 };
        entity.move_to(&server, 30, 40).unwrap();

        assert_eq!((entity.geometry.x, entity.geometry.y), (30, 40));
        assert_eq!((entity.geometry.width, entity.geometry.height), (640, 480));
        match &server.sent()[..] {
            [Request::Configure(7, aux)] => {
                assert_eq!(aux.x, Some(30));
                assert_eq!(aux.y, Some(40));
                assert_eq!(aux.width, None);
                assert_eq!(aux.height, None);
                assert_eq!(aux.stack_mode, None);
            }
            other => panic!("wrong requests: {other:?}"),
        }
    }

    #[test]
    fn resize_sends_only_the_size() {
        let server = FakeServer::default();
        let mut entity = adopted(7);
        entity.geometry = Geometry { x: 30, y: 40, width: 640, height: 480, border_width: 2 };
        entity.resize(&server, 800, 600).unwrap();

        assert_eq!((entity.geometry.width, entity.geometry.height), (800, 600));
        assert_eq!((entity.geometry.x, entity.geometry.y), (30, 40));
        match &server.sent()[..] {
            [Request::Configure(7, aux)] => {
                assert_eq!(aux.width, Some(800));
                assert_eq!(aux.height, Some(600));
                assert_eq!(aux.x, None);
                assert_eq!(aux.y, None);
            }
            other => panic!("wrong requests: {other:?}"),
        }
    }

    #[test]
    fn set_border_width_sends_only_the_border() {
        let server = FakeServer::default();
        let mut entity = adopted(7);
        entity.set_border_width(&server, 2).unwrap();

        assert_eq!(entity.geometry.border_width, 2);
        match &server.sent()[..] {
            [Request::Configure(7, aux)] => {
                assert_eq!(aux.border_width, Some(2));
                assert_eq!(aux.x, None);
                assert_eq!(aux.width, None);
            }
            other => panic!("wrong requests: {other:?}"),
        }
    }

    #[test]
    fn focus_sets_input_focus_then_raises() {
        let server = FakeServer::default();
        let entity = adopted(7);
        entity.focus(&server).unwrap();

        match &server.sent()[..] {
            [Request::Focus(7), Request::Configure(7, aux)] => {
                assert_eq!(aux.stack_mode, Some(StackMode::ABOVE));
            }
            other => panic!("wrong requests: {other:?}"),
        }
    }

    #[test]
    fn lower_restacks_below() {
        let server = FakeServer::default();
        let entity = adopted(7);
        entity.lower(&server).unwrap();

        match &server.sent()[..] {
            [Request::Configure(7, aux)] => {
                assert_eq!(aux.stack_mode, Some(StackMode::BELOW));
            }
            other => panic!("wrong requests: {other:?}"),
        }
    }

    #[test]
    fn release_destroys_only_owned_windows() {
        let server = FakeServer::default();
        created(9).release(&server);
        assert!(matches!(server.sent()[..], [Request::Destroy(9)]));

        let server = FakeServer::default();
        adopted(9).release(&server);
        assert!(server.sent().is_empty());
    }

    #[test]
    fn registry_holds_at_most_one_entity_per_id() {
        let mut registry = WindowRegistry::new();
        assert!(registry.insert(adopted(100)).is_none());
        let displaced = registry.insert(adopted(100));
        assert!(displaced.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_entries_are_removed_exactly_once() {
        let mut registry = WindowRegistry::new();
        registry.insert(adopted(7));
        assert!(registry.remove(7).is_some());
        assert!(registry.remove(7).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_the_focused_window_clears_focus() {
        let mut registry = WindowRegistry::new();
        registry.insert(adopted(7));
        registry.set_focused(Some(7));
        registry.remove(7);
        assert_eq!(registry.focused(), None);
    }

    #[test]
    fn drain_empties_the_registry() {
        let mut registry = WindowRegistry::new();
        registry.insert(adopted(1));
        registry.insert(adopted(2));
        registry.set_focused(Some(1));
        let drained: Vec<_> = registry.drain().collect();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.focused(), None);
    }

    #[test]
    fn override_redirect_windows_are_never_managed() {
        assert!(!manage_policy(true, true, None));
        assert!(!manage_policy(true, true, Some("xterm\0XTerm")));
        assert!(!manage_policy(true, false, Some("desktop")));
    }

    #[test]
    fn unviewable_windows_are_not_managed() {
        assert!(!manage_policy(false, false, None));
        assert!(!manage_policy(false, false, Some("xterm\0XTerm")));
    }

    #[test]
    fn desktop_and_dock_classes_are_excluded() {
        assert!(!manage_policy(false, true, Some("xfdesktop\0Xfdesktop-desktop")));
        assert!(!manage_policy(false, true, Some("panel\0dock")));
        assert!(manage_policy(false, true, Some("xterm\0XTerm")));
    }

    #[test]
    fn missing_class_excludes_nothing() {
        assert!(manage_policy(false, true, None));
    }
}
