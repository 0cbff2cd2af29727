//! v1 → current: the original schema had one flat `storage`
//! table and one child table per entry kind with no entity grouping at
//! all. Every storage becomes its own synthetic FULL entity; each child
//! row is split into a shared `entries` row plus its per-type row.

use crate::catalog::{self, ArchiveType, EntryType};
use crate::database::{DatabaseHandle, SqlValue};
use crate::error::{CatalogError, DatabaseError};

pub fn migrate(old: &DatabaseHandle, new: &DatabaseHandle) -> Result<(), CatalogError> {
    catalog::fix_broken_ids(old, "storage")?;

    let mut storages = old.prepare("SELECT id, name, createdDateTime, size FROM storage", &[])?;
    let mut rows = Vec::new();
    while let Some(row) = storages.next_row()? {
        rows.push((row.get_i64(0)?, row.get_string(1)?, row.get_i64(2)?, row.get_i64(3)?));
    }
    drop(storages);

    for (old_storage_id, name, created, size) in rows {
        let job_uuid = uuid::Uuid::new_v4().to_string();
        let entity_id = catalog::new_entity(
            new,
            &job_uuid,
            None,
            None,
            None,
            ArchiveType::Full as i64,
            created,
            false,
        )?;

        new.execute(
            "INSERT INTO storages (entityId, name, createdDateTime, size) VALUES (?, ?, ?, ?)",
            &[
                SqlValue::Int(entity_id),
                SqlValue::Text(name),
                SqlValue::Int(created),
                SqlValue::Int(size),
            ],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
        let new_storage_id = new.last_insert_rowid();

        copy_directories(old, new, old_storage_id, new_storage_id)?;
        copy_files(old, new, old_storage_id, new_storage_id)?;
        copy_images(old, new, old_storage_id, new_storage_id)?;
        copy_links(old, new, old_storage_id, new_storage_id)?;
        copy_special(old, new, old_storage_id, new_storage_id)?;
    }

    Ok(())
}

fn new_entry(
    new: &DatabaseHandle,
    storage_id: i64,
    entry_type: EntryType,
    name: &str,
) -> Result<i64, CatalogError> {
    new.execute(
        "INSERT INTO entries (storageId, type, name) VALUES (?, ?, ?)",
        &[
            SqlValue::Int(storage_id),
            SqlValue::Int(entry_type as i64),
            SqlValue::Text(name.to_string()),
        ],
        None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
    )?;
    Ok(new.last_insert_rowid())
}

fn copy_directories(old: &DatabaseHandle, new: &DatabaseHandle, old_storage_id: i64, new_storage_id: i64) -> Result<(), CatalogError> {
    if !old.table_exists("directories")? {
        return Ok(());
    }
    let mut q = old.prepare("SELECT name FROM directories WHERE storageId=?", &[SqlValue::Int(old_storage_id)])?;
    while let Some(row) = q.next_row()? {
        let name = row.get_string(0)?;
        let entry_id = new_entry(new, new_storage_id, EntryType::Directory, &name)?;
        new.execute(
            "INSERT INTO directoryEntries (entryId, storageId, name) VALUES (?, ?, ?)",
            &[SqlValue::Int(entry_id), SqlValue::Int(new_storage_id), SqlValue::Text(name)],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
    }
    Ok(())
}

fn copy_files(old: &DatabaseHandle, new: &DatabaseHandle, old_storage_id: i64, new_storage_id: i64) -> Result<(), CatalogError> {
    if !old.table_exists("files")? {
        return Ok(());
    }
    let mut q = old.prepare(
        "SELECT name, size, fragmentOffset, fragmentSize FROM files WHERE storageId=?",
        &[SqlValue::Int(old_storage_id)],
    )?;
    while let Some(row) = q.next_row()? {
        let name = row.get_string(0)?;
        let size = row.get_i64(1)?;
        let fragment_offset = row.get_i64(2)?;
        let fragment_size = row.get_i64(3)?;
        let entry_id = new_entry(new, new_storage_id, EntryType::File, &name)?;
        new.execute(
            "INSERT INTO fileEntries (entryId, storageId, size, fragmentOffset, fragmentSize) VALUES (?, ?, ?, ?, ?)",
            &[
                SqlValue::Int(entry_id),
                SqlValue::Int(new_storage_id),
                SqlValue::Int(size),
                SqlValue::Int(fragment_offset),
                SqlValue::Int(fragment_size),
            ],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
    }
    Ok(())
}

fn copy_images(old: &DatabaseHandle, new: &DatabaseHandle, old_storage_id: i64, new_storage_id: i64) -> Result<(), CatalogError> {
    if !old.table_exists("images")? {
        return Ok(());
    }
    let mut q = old.prepare(
        "SELECT name, size, fileSystemType, blockSize, blockOffset, blockCount FROM images WHERE storageId=?",
        &[SqlValue::Int(old_storage_id)],
    )?;
    while let Some(row) = q.next_row()? {
        let name = row.get_string(0)?;
        let size = row.get_i64(1)?;
        let fs_type = row.get_i64(2)?;
        let block_size = row.get_i64(3)?;
        let block_offset = row.get_i64(4)?;
        let block_count = row.get_i64(5)?;
        let entry_id = new_entry(new, new_storage_id, EntryType::Image, &name)?;
        new.execute(
            "INSERT INTO imageEntries (entryId, storageId, size, fileSystemType, blockSize, blockOffset, blockCount)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::Int(entry_id),
                SqlValue::Int(new_storage_id),
                SqlValue::Int(size),
                SqlValue::Int(fs_type),
                SqlValue::Int(block_size),
                SqlValue::Int(block_offset),
                SqlValue::Int(block_count),
            ],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
    }
    Ok(())
}

fn copy_links(old: &DatabaseHandle, new: &DatabaseHandle, old_storage_id: i64, new_storage_id: i64) -> Result<(), CatalogError> {
    if !old.table_exists("links")? {
        return Ok(());
    }
    let mut q = old.prepare(
        "SELECT name, destinationName FROM links WHERE storageId=?",
        &[SqlValue::Int(old_storage_id)],
    )?;
    while let Some(row) = q.next_row()? {
        let name = row.get_string(0)?;
        let destination = row.get_string(1)?;
        let entry_id = new_entry(new, new_storage_id, EntryType::Link, &name)?;
        new.execute(
            "INSERT INTO linkEntries (entryId, storageId, destinationName) VALUES (?, ?, ?)",
            &[SqlValue::Int(entry_id), SqlValue::Int(new_storage_id), SqlValue::Text(destination)],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
    }
    Ok(())
}

fn copy_special(old: &DatabaseHandle, new: &DatabaseHandle, old_storage_id: i64, new_storage_id: i64) -> Result<(), CatalogError> {
    if !old.table_exists("special")? {
        return Ok(());
    }
    let mut q = old.prepare(
        "SELECT name, specialType, major, minor FROM special WHERE storageId=?",
        &[SqlValue::Int(old_storage_id)],
    )?;
    while let Some(row) = q.next_row()? {
        let name = row.get_string(0)?;
        let special_type = row.get_i64(1)?;
        let major = row.get_i64(2)?;
        let minor = row.get_i64(3)?;
        let entry_id = new_entry(new, new_storage_id, EntryType::Special, &name)?;
        new.execute(
            "INSERT INTO specialEntries (entryId, storageId, specialType, major, minor) VALUES (?, ?, ?, ?, ?)",
            &[
                SqlValue::Int(entry_id),
                SqlValue::Int(new_storage_id),
                SqlValue::Int(special_type),
                SqlValue::Int(major),
                SqlValue::Int(minor),
            ],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
    }
    Ok(())
}
