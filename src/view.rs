//! Chart view placement inside a shared canvas section.
//!
//! The chart is drawn across the entire section and then shifted so this
//! client's viewport shows its own slice. The host owns scheduling: it calls
//! [`ViewHost::notify`] on every state change, and registered handlers receive
//! the current [`LayoutRect`].

use imagetiles_common::LayoutRect;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where to put the rendered chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub translate_x: i64,
    pub translate_y: i64,
    pub width: u32,
    pub height: u32,
}

impl Placement {
    pub fn for_layout(layout: &LayoutRect) -> Self {
        Self {
            translate_x: layout.x.saturating_neg(),
            translate_y: layout.y.saturating_neg(),
            width: layout.width,
            height: layout.height,
        }
    }

    /// CSS `transform` value, e.g. `translate(-1920px,0px)`.
    pub fn css_transform(&self) -> String {
        format!("translate({}px,{}px)", self.translate_x, self.translate_y)
    }
}

/// Handle returned by [`ViewHost::on_state_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&LayoutRect) + Send + Sync>;

/// Registry of state-change handlers.
#[derive(Default)]
pub struct ViewHost {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, Handler)>>,
    last_layout: RwLock<Option<LayoutRect>>,
}

impl ViewHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. If the host has already reported a layout the
    /// handler is called with it immediately.
    pub fn on_state_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&LayoutRect) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        self.handlers.write().push((id, handler.clone()));

        let last = *self.last_layout.read();
        if let Some(layout) = last {
            handler(&layout);
        }
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Called by the host when the layout or view state changes.
    pub fn notify(&self, layout: &LayoutRect) {
        *self.last_layout.write() = Some(*layout);

        // Handlers run without the lock held so they may register or remove.
        let handlers: Vec<Handler> = self.handlers.read().iter().map(|(_, h)| h.clone()).collect();
        tracing::trace!(handlers = handlers.len(), ?layout, "view state update");
        for handler in handlers {
            handler(layout);
        }
    }

    pub fn last_layout(&self) -> Option<LayoutRect> {
        *self.last_layout.read()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}
