//! Database query modules.

pub mod image_files;
