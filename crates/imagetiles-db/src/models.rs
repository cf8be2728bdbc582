//! Rust structs mapping to the `image_files` table, plus the write-side
//! validation rules shared by create and update.

use imagetiles_common::{Error, ImageFileId, Result};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Maximum filename length, counted in characters.
pub const FILENAME_MAX_CHARS: usize = 50;

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(T::from(uuid))
}

// ---------------------------------------------------------------------------
// ImageFile
// ---------------------------------------------------------------------------

/// Metadata for one uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFile {
    pub id: ImageFileId,
    pub filename: String,
    pub project: String,
    pub width: i32,
    pub height: i32,
    pub description: Option<String>,
}

impl ImageFile {
    /// Expects columns in order: id, filename, project, width, height, description.
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            filename: row.get(1)?,
            project: row.get(2)?,
            width: row.get(3)?,
            height: row.get(4)?,
            description: row.get(5)?,
        })
    }
}

// ---------------------------------------------------------------------------
// NewImageFile
// ---------------------------------------------------------------------------

/// Caller-supplied fields for a new image file. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewImageFile {
    pub filename: String,
    pub project: String,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewImageFile {
    pub fn new(
        filename: impl Into<String>,
        project: impl Into<String>,
        width: i32,
        height: i32,
    ) -> Self {
        Self {
            filename: filename.into(),
            project: project.into(),
            width,
            height,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check every field against the write constraints.
    pub fn validate(&self) -> Result<()> {
        validate_filename(&self.filename)?;
        validate_project(&self.project)?;
        validate_dimension("width", self.width)?;
        validate_dimension("height", self.height)?;
        Ok(())
    }

    /// Attach a freshly generated id.
    pub(crate) fn into_record(self) -> ImageFile {
        ImageFile {
            id: ImageFileId::new(),
            filename: self.filename,
            project: self.project,
            width: self.width,
            height: self.height,
            description: self.description,
        }
    }
}

// ---------------------------------------------------------------------------
// ImageFileUpdate
// ---------------------------------------------------------------------------

/// Partial update. `None` leaves a field untouched.
///
/// `description` is doubly optional: `Some(None)` clears it. `id` exists only
/// so that an attempt to change it can be rejected instead of ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageFileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
}

/// A present key (even `null`) becomes `Some(..)`; a missing key stays `None`
/// through `#[serde(default)]`.
fn present_or_null<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl ImageFileUpdate {
    /// True when the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.filename.is_none()
            && self.project.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.description.is_none()
    }

    /// Validate the fields being changed with the same rules as create.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.id {
            return Err(Error::validation(format!("id is immutable (attempted to set {id})")));
        }
        if let Some(filename) = &self.filename {
            validate_filename(filename)?;
        }
        if let Some(project) = &self.project {
            validate_project(project)?;
        }
        if let Some(width) = self.width {
            validate_dimension("width", width)?;
        }
        if let Some(height) = self.height {
            validate_dimension("height", height)?;
        }
        Ok(())
    }

    /// Apply the changed fields onto an existing record.
    pub fn apply_to(&self, file: &mut ImageFile) {
        if let Some(filename) = &self.filename {
            file.filename = filename.clone();
        }
        if let Some(project) = &self.project {
            file.project = project.clone();
        }
        if let Some(width) = self.width {
            file.width = width;
        }
        if let Some(height) = self.height {
            file.height = height;
        }
        if let Some(description) = &self.description {
            file.description = description.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// validation
// ---------------------------------------------------------------------------

/// Filename must be non-blank and at most [`FILENAME_MAX_CHARS`] characters.
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.trim().is_empty() {
        return Err(Error::validation("filename is required"));
    }
    let len = filename.chars().count();
    if len > FILENAME_MAX_CHARS {
        return Err(Error::validation(format!(
            "filename is {len} characters, maximum is {FILENAME_MAX_CHARS}"
        )));
    }
    Ok(())
}

/// Project must be non-blank.
pub fn validate_project(project: &str) -> Result<()> {
    if project.trim().is_empty() {
        return Err(Error::validation("project is required"));
    }
    Ok(())
}

/// Dimensions may be zero (not yet measured) but never negative.
pub fn validate_dimension(field: &str, value: i32) -> Result<()> {
    if value < 0 {
        return Err(Error::validation(format!(
            "{field} must not be negative (got {value})"
        )));
    }
    Ok(())
}
