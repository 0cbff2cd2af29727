//! v6 → current: schema is already entity/storage/entry
//! shaped, so migration is a structural row-by-row copy with id
//! remapping, plus re-homing of orphan storages (storages whose
//! `entityId` is null) onto a matching or freshly synthesized entity.

use std::collections::HashMap;

use crate::catalog::{self, ArchiveType};
use crate::database::{DatabaseHandle, SqlValue};
use crate::error::{CatalogError, DatabaseError};

const PER_TYPE_TABLES: &[&str] = &[
    "fileEntries",
    "imageEntries",
    "directoryEntries",
    "linkEntries",
    "hardlinkEntries",
    "specialEntries",
];

pub fn migrate(old: &DatabaseHandle, new: &DatabaseHandle) -> Result<(), CatalogError> {
    copy_uuids(old, new)?;

    let mut entity_map = HashMap::new();
    copy_entities(old, new, &mut entity_map)?;

    let mut storage_map = HashMap::new();
    copy_attached_storages(old, new, &entity_map, &mut storage_map)?;
    copy_orphan_storages(old, new, &mut storage_map)?;

    for (old_storage_id, new_storage_id) in storage_map {
        copy_entries(old, new, old_storage_id, new_storage_id)?;
    }

    Ok(())
}

fn copy_uuids(old: &DatabaseHandle, new: &DatabaseHandle) -> Result<(), CatalogError> {
    let mut q = old.prepare("SELECT uuid FROM uuids", &[])?;
    while let Some(row) = q.next_row()? {
        let uuid = row.get_string(0)?;
        new.execute(
            "INSERT OR IGNORE INTO uuids (uuid) VALUES (?)",
            &[SqlValue::Text(uuid)],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
    }
    Ok(())
}

fn copy_entities(
    old: &DatabaseHandle,
    new: &DatabaseHandle,
    entity_map: &mut HashMap<i64, i64>,
) -> Result<(), CatalogError> {
    let mut q = old.prepare(
        "SELECT id, jobUuid, scheduleUuid, hostName, userName, archiveType, createdDateTime, locked FROM entities",
        &[],
    )?;
    let mut rows = Vec::new();
    while let Some(row) = q.next_row()? {
        rows.push((
            row.get_i64(0)?,
            row.get_string(1)?,
            if row.is_null(2) { None } else { Some(row.get_string(2)?) },
            if row.is_null(3) { None } else { Some(row.get_string(3)?) },
            if row.is_null(4) { None } else { Some(row.get_string(4)?) },
            row.get_i64(5)?,
            row.get_i64(6)?,
            row.get_bool(7)?,
        ));
    }
    drop(q);

    for (old_id, job_uuid, schedule_uuid, host, user, archive_type, created, locked) in rows {
        let new_id = catalog::new_entity(
            new,
            &job_uuid,
            schedule_uuid.as_deref(),
            host.as_deref(),
            user.as_deref(),
            archive_type,
            created,
            locked,
        )?;
        entity_map.insert(old_id, new_id);
    }

    Ok(())
}

fn copy_attached_storages(
    old: &DatabaseHandle,
    new: &DatabaseHandle,
    entity_map: &HashMap<i64, i64>,
    storage_map: &mut HashMap<i64, i64>,
) -> Result<(), CatalogError> {
    let mut q = old.prepare(
        "SELECT id, entityId, name, createdDateTime, size, state FROM storages WHERE entityId IS NOT NULL",
        &[],
    )?;
    let mut rows = Vec::new();
    while let Some(row) = q.next_row()? {
        rows.push((
            row.get_i64(0)?,
            row.get_i64(1)?,
            row.get_string(2)?,
            row.get_i64(3)?,
            row.get_i64(4)?,
            row.get_i64(5)?,
        ));
    }
    drop(q);

    for (old_id, old_entity_id, name, created, size, state) in rows {
        let new_entity_id = *entity_map
            .get(&old_entity_id)
            .ok_or_else(|| CatalogError::CallbackAborted(format!("entity {} missing", old_entity_id)))?;
        new.execute(
            "INSERT INTO storages (entityId, name, createdDateTime, size, state) VALUES (?, ?, ?, ?, ?)",
            &[
                SqlValue::Int(new_entity_id),
                SqlValue::Text(name),
                SqlValue::Int(created),
                SqlValue::Int(size),
                SqlValue::Int(state),
            ],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
        storage_map.insert(old_id, new.last_insert_rowid());
    }

    Ok(())
}

/// Re-homes storages whose `entityId` is null: attach to an existing
/// entity sharing the storage's job uuid, or synthesize a new locked FULL
/// entity and unlock it once the storage is copied.
fn copy_orphan_storages(
    old: &DatabaseHandle,
    new: &DatabaseHandle,
    storage_map: &mut HashMap<i64, i64>,
) -> Result<(), CatalogError> {
    let mut q = old.prepare(
        "SELECT id, name, createdDateTime, size, state FROM storages WHERE entityId IS NULL",
        &[],
    )?;
    let mut rows = Vec::new();
    while let Some(row) = q.next_row()? {
        rows.push((
            row.get_i64(0)?,
            row.get_string(1)?,
            row.get_i64(2)?,
            row.get_i64(3)?,
            row.get_i64(4)?,
        ));
    }
    drop(q);

    for (old_id, name, created, size, state) in rows {
        // The orphan's job uuid isn't stored on the storage row itself in
        // the v6 schema; it's recovered from the storage's own name, which
        // the original encodes as "<jobUuid>/<storageName>".
        let job_uuid = name.split('/').next().unwrap_or(&name).to_string();

        let (entity_id, synthesized) = match catalog::find_entity(new, &job_uuid, None)? {
            Some(entity) => (entity.id, false),
            None => {
                let id = catalog::new_entity(new, &job_uuid, None, None, None, ArchiveType::Full as i64, created, true)?;
                (id, true)
            }
        };

        new.execute(
            "INSERT INTO storages (entityId, name, createdDateTime, size, state) VALUES (?, ?, ?, ?, ?)",
            &[
                SqlValue::Int(entity_id),
                SqlValue::Text(name),
                SqlValue::Int(created),
                SqlValue::Int(size),
                SqlValue::Int(state),
            ],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
        storage_map.insert(old_id, new.last_insert_rowid());

        if synthesized {
            catalog::unlock_entity(new, entity_id)?;
        }
    }

    Ok(())
}

fn copy_entries(old: &DatabaseHandle, new: &DatabaseHandle, old_storage_id: i64, new_storage_id: i64) -> Result<(), CatalogError> {
    let mut q = old.prepare(
        "SELECT id, type, name, size, timeLastAccess, timeModified, timeLastChanged, userId, groupId, permission
         FROM entries WHERE storageId=?",
        &[SqlValue::Int(old_storage_id)],
    )?;
    let mut rows = Vec::new();
    while let Some(row) = q.next_row()? {
        rows.push((
            row.get_i64(0)?,
            row.get_i64(1)?,
            row.get_string(2)?,
            row.get_i64(3)?,
            row.get_i64(4)?,
            row.get_i64(5)?,
            row.get_i64(6)?,
            row.get_i64(7)?,
            row.get_i64(8)?,
            row.get_i64(9)?,
        ));
    }
    drop(q);

    for (old_entry_id, entry_type, name, size, atime, mtime, ctime, uid, gid, perm) in rows {
        new.execute(
            "INSERT INTO entries (storageId, type, name, size, timeLastAccess, timeModified, timeLastChanged, userId, groupId, permission)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::Int(new_storage_id),
                SqlValue::Int(entry_type),
                SqlValue::Text(name),
                SqlValue::Int(size),
                SqlValue::Int(atime),
                SqlValue::Int(mtime),
                SqlValue::Int(ctime),
                SqlValue::Int(uid),
                SqlValue::Int(gid),
                SqlValue::Int(perm),
            ],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
        let new_entry_id = new.last_insert_rowid();

        for table in PER_TYPE_TABLES {
            copy_per_type_row(old, new, table, old_entry_id, new_entry_id, new_storage_id)?;
        }
    }

    Ok(())
}

fn copy_per_type_row(
    old: &DatabaseHandle,
    new: &DatabaseHandle,
    table: &str,
    old_entry_id: i64,
    new_entry_id: i64,
    new_storage_id: i64,
) -> Result<(), CatalogError> {
    if !old.table_exists(table)? {
        return Ok(());
    }
    let columns = old.table_columns(table)?;
    let data_columns: Vec<&String> = columns
        .iter()
        .filter(|c| c.as_str() != "entryId" && c.as_str() != "storageId")
        .collect();
    if data_columns.is_empty() {
        return Ok(());
    }

    let select_list = data_columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ");
    let mut q = old.prepare(
        &format!("SELECT {} FROM {} WHERE entryId=?", select_list, table),
        &[SqlValue::Int(old_entry_id)],
    )?;

    if let Some(row) = q.next_row()? {
        let mut values = vec![SqlValue::Int(new_entry_id), SqlValue::Int(new_storage_id)];
        for i in 0..data_columns.len() {
            values.push(if row.is_null(i) {
                SqlValue::Null
            } else {
                row.get_string(i).map(SqlValue::Text)?
            });
        }
        let insert_columns = format!(
            "entryId, storageId, {}",
            data_columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
        );
        let placeholders = vec!["?"; values.len()].join(", ");
        new.execute(
            &format!("INSERT INTO {} ({}) VALUES ({})", table, insert_columns, placeholders),
            &values,
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema;
    use crate::database::{OpenFlags, OpenMode};
    use crate::error::DatabaseError;

    fn open_memory() -> DatabaseHandle {
        DatabaseHandle::open(":memory:", OpenMode::Create, OpenFlags { memory: true, ..Default::default() }, None).unwrap()
    }

    /// Builds an old-style (pre-migration) v6 database: entities/storages/
    /// entries shaped like the current schema, but with one attached storage
    /// and one orphan (entityId NULL) storage whose name encodes its job
    /// uuid as "<jobUuid>/<name>".
    fn seed_old_v6() -> DatabaseHandle {
        let old = open_memory();
        schema::ensure_schema(&old).unwrap();

        old.execute("INSERT INTO uuids (uuid) VALUES ('u-1')", &[], None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>).unwrap();

        old.execute(
            "INSERT INTO entities (id, jobUuid, archiveType, createdDateTime, locked) VALUES (1, 'J', 1, 100, 0)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();

        old.execute(
            "INSERT INTO storages (id, entityId, name, createdDateTime) VALUES (1, 1, 'J/storage-a', 100)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();
        old.execute(
            "INSERT INTO storages (id, entityId, name, createdDateTime) VALUES (2, NULL, 'K/storage-b', 200)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();

        old.execute(
            "INSERT INTO entries (id, storageId, type, name) VALUES (1, 1, 0, 'file-a')",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();
        old.execute(
            "INSERT INTO fileEntries (entryId, storageId, size) VALUES (1, 1, 1234)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();

        old.execute(
            "INSERT INTO entries (id, storageId, type, name) VALUES (2, 2, 2, 'dir-b')",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();
        old.execute(
            "INSERT INTO directoryEntries (entryId, storageId, name) VALUES (2, 2, 'dir-b')",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();

        old
    }

    /// Seed scenario from the spec: one entity with one attached storage,
    /// plus one orphan storage under a different job uuid. After migration
    /// the orphan must land on a freshly synthesized, locked-then-unlocked
    /// FULL entity, while entries and their per-type rows follow their
    /// storage across the id remap.
    #[test]
    fn migrates_attached_and_orphan_storages() {
        let old = seed_old_v6();
        let new = open_memory();
        schema::ensure_schema(&new).unwrap();

        migrate(&old, &new).unwrap();

        let mut entity_count = 0i64;
        new.execute("SELECT COUNT(*) FROM entities", &[], Some(|row: &rusqlite::Row| {
            entity_count = row.get(0)?;
            Ok(())
        })).unwrap();
        assert_eq!(entity_count, 2);

        let mut storage_count = 0i64;
        new.execute("SELECT COUNT(*) FROM storages", &[], Some(|row: &rusqlite::Row| {
            storage_count = row.get(0)?;
            Ok(())
        })).unwrap();
        assert_eq!(storage_count, 2);

        let j_entity = crate::catalog::find_entity(&new, "J", None).unwrap().unwrap();
        assert!(!j_entity.locked);

        let k_entity = crate::catalog::find_entity(&new, "K", None).unwrap().unwrap();
        assert_eq!(k_entity.archive_type, ArchiveType::Full as i64);
        assert!(!k_entity.locked, "synthesized orphan entity must be unlocked once its storage is attached");

        let mut entry_count = 0i64;
        new.execute("SELECT COUNT(*) FROM entries", &[], Some(|row: &rusqlite::Row| {
            entry_count = row.get(0)?;
            Ok(())
        })).unwrap();
        assert_eq!(entry_count, 2);

        let mut file_entry_count = 0i64;
        new.execute("SELECT COUNT(*) FROM fileEntries", &[], Some(|row: &rusqlite::Row| {
            file_entry_count = row.get(0)?;
            Ok(())
        })).unwrap();
        assert_eq!(file_entry_count, 1);

        let mut dir_entry_count = 0i64;
        new.execute("SELECT COUNT(*) FROM directoryEntries", &[], Some(|row: &rusqlite::Row| {
            dir_entry_count = row.get(0)?;
            Ok(())
        })).unwrap();
        assert_eq!(dir_entry_count, 1);
    }

    #[test]
    fn reuses_existing_entity_for_matching_job_uuid_orphan() {
        let old = open_memory();
        schema::ensure_schema(&old).unwrap();
        old.execute(
            "INSERT INTO entities (id, jobUuid, archiveType, createdDateTime, locked) VALUES (1, 'J', 1, 100, 0)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();
        old.execute(
            "INSERT INTO storages (id, entityId, name, createdDateTime) VALUES (1, NULL, 'J/storage-a', 100)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();

        let new = open_memory();
        schema::ensure_schema(&new).unwrap();

        migrate(&old, &new).unwrap();

        let mut entity_count = 0i64;
        new.execute("SELECT COUNT(*) FROM entities", &[], Some(|row: &rusqlite::Row| {
            entity_count = row.get(0)?;
            Ok(())
        })).unwrap();
        // the orphan's job uuid "J" matches the one pre-existing entity, so
        // no synthetic entity should be created.
        assert_eq!(entity_count, 1);
    }
}
