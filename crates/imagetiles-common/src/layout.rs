//! Layout rectangle produced by the canvas layout collaborator.
//!
//! `x`/`y` locate this client's viewport inside the section; `width` and
//! `height` are the size of the whole section. The metadata store never
//! depends on this type.

use serde::{Deserialize, Serialize};

/// A client's position within a shared canvas section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayoutRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl LayoutRect {
    pub fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True when the section has no drawable area.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}
