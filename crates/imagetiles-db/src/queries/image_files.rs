//! Image file CRUD operations.
//!
//! Writes validate before touching the database, so a rejected write never
//! leaves a row behind.

use imagetiles_common::{Error, ImageFileId, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::models::{ImageFile, ImageFileUpdate, NewImageFile};

const COLS: &str = "id, filename, project, width, height, description";

/// Create a new image file record with a freshly generated id.
pub fn create_image_file(conn: &Connection, new: NewImageFile) -> Result<ImageFile> {
    new.validate()?;
    let file = new.into_record();

    conn.execute(
        "INSERT INTO image_files (id, filename, project, width, height, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            file.id.to_string(),
            file.filename,
            file.project,
            file.width,
            file.height,
            file.description,
        ],
    )
    .map_err(Error::database)?;

    Ok(file)
}

/// Get an image file by ID.
pub fn get_image_file(conn: &Connection, id: ImageFileId) -> Result<Option<ImageFile>> {
    let q = format!("SELECT {COLS} FROM image_files WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], ImageFile::from_row)
        .optional()
        .map_err(Error::database)
}

/// Apply a partial update.
///
/// Returns `Ok(None)` if the record does not exist. The read, validation and
/// write run in one IMMEDIATE transaction, so concurrent updates to the same
/// id serialize.
pub fn update_image_file(
    conn: &Connection,
    id: ImageFileId,
    update: &ImageFileUpdate,
) -> Result<Option<ImageFile>> {
    update.validate()?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(Error::database)?;

    let Some(mut file) = get_image_file(&tx, id)? else {
        return Ok(None);
    };
    if update.is_empty() {
        return Ok(Some(file));
    }
    update.apply_to(&mut file);

    tx.execute(
        "UPDATE image_files
         SET filename = ?2, project = ?3, width = ?4, height = ?5, description = ?6
         WHERE id = ?1",
        rusqlite::params![
            file.id.to_string(),
            file.filename,
            file.project,
            file.width,
            file.height,
            file.description,
        ],
    )
    .map_err(Error::database)?;
    tx.commit().map_err(Error::database)?;

    Ok(Some(file))
}

/// Delete an image file by ID. Returns `false` if it did not exist.
pub fn delete_image_file(conn: &Connection, id: ImageFileId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM image_files WHERE id = ?1", [id.to_string()])
        .map_err(Error::database)?;
    Ok(n > 0)
}

/// One page of image files in ascending id order, starting after `after`.
pub fn list_image_files_page(
    conn: &Connection,
    project: Option<&str>,
    after: Option<ImageFileId>,
    limit: u32,
) -> Result<Vec<ImageFile>> {
    let q = format!(
        "SELECT {COLS} FROM image_files
         WHERE (?1 IS NULL OR project = ?1) AND (?2 IS NULL OR id > ?2)
         ORDER BY id
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&q).map_err(Error::database)?;
    let rows = stmt
        .query_map(
            rusqlite::params![project, after.map(|a| a.to_string()), limit],
            ImageFile::from_row,
        )
        .map_err(Error::database)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::database)?;
    Ok(rows)
}

/// Count image files, optionally within one project.
pub fn count_image_files(conn: &Connection, project: Option<&str>) -> Result<u64> {
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM image_files WHERE ?1 IS NULL OR project = ?1",
            [project],
            |row| row.get(0),
        )
        .map_err(Error::database)?;
    Ok(n as u64)
}

/// Distinct owning projects, sorted.
pub fn list_projects(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT project FROM image_files ORDER BY project")
        .map_err(Error::database)?;
    let rows = stmt
        .query_map([], |row| row.get(0))
        .map_err(Error::database)?
        .collect::<std::result::Result<Vec<String>, _>>()
        .map_err(Error::database)?;
    Ok(rows)
}
