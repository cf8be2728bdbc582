//! imagetiles-common: shared types, IDs, and errors.
//!
//! This crate provides the pieces used by both the metadata store and the
//! binary:
//!
//! - **Typed IDs**: UUID newtypes for image files
//! - **Error Handling**: the unified error type and result alias
//! - **Layout**: the rectangle handed over by the canvas layout collaborator
//!
//! # Examples
//!
//! ```
//! use imagetiles_common::{Error, ImageFileId, Result};
//!
//! let id = ImageFileId::new();
//!
//! fn lookup(id: ImageFileId) -> Result<()> {
//!     Err(Error::not_found("image file", id))
//! }
//!
//! assert!(lookup(id).unwrap_err().is_recoverable());
//! ```

pub mod error;
pub mod ids;
pub mod layout;

pub use error::{Error, Result};
pub use ids::*;
pub use layout::LayoutRect;
