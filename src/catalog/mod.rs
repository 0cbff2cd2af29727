//! Catalog Index: the relational schema layered on the Database
//! Engine, plus versioned forward migration.

pub mod migrate;
pub mod schema;

use crate::database::{DatabaseHandle, SqlValue};
use crate::error::CatalogError;

pub use schema::{compare, SchemaDiff, CURRENT_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveType {
    Normal = 0,
    Full = 1,
    Incremental = 2,
    Differential = 3,
    Continuous = 4,
}

impl ArchiveType {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(ArchiveType::Normal),
            1 => Some(ArchiveType::Full),
            2 => Some(ArchiveType::Incremental),
            3 => Some(ArchiveType::Differential),
            4 => Some(ArchiveType::Continuous),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArchiveType::Normal => "normal",
            ArchiveType::Full => "full",
            ArchiveType::Incremental => "incremental",
            ArchiveType::Differential => "differential",
            ArchiveType::Continuous => "continuous",
        }
    }
}

impl std::str::FromStr for ArchiveType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(ArchiveType::Normal),
            "full" => Ok(ArchiveType::Full),
            "incremental" => Ok(ArchiveType::Incremental),
            "differential" => Ok(ArchiveType::Differential),
            "continuous" => Ok(ArchiveType::Continuous),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The full closed set, in declaration order -- used by schedule-info
/// sidecar writing to emit one line per archive type that has
/// ever run.
pub const ARCHIVE_TYPES: [ArchiveType; 5] = [
    ArchiveType::Normal,
    ArchiveType::Full,
    ArchiveType::Incremental,
    ArchiveType::Differential,
    ArchiveType::Continuous,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File = 0,
    Image = 1,
    Directory = 2,
    Link = 3,
    Hardlink = 4,
    Special = 5,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: i64,
    pub job_uuid: String,
    pub schedule_uuid: Option<String>,
    pub host_name: Option<String>,
    pub user_name: Option<String>,
    pub archive_type: i64,
    pub created_date_time: i64,
    pub locked: bool,
}

#[derive(Debug, Clone)]
pub struct Storage {
    pub id: i64,
    pub entity_id: Option<i64>,
    pub name: String,
    pub created_date_time: i64,
    pub size: i64,
    pub state: i64,
}

/// Opens or reuses the catalog's metadata table, creating it fresh if
/// absent, and runs any pending migration otherwise.
pub fn open(db: &DatabaseHandle) -> Result<(), CatalogError> {
    match schema::schema_version(db)? {
        None => schema::ensure_schema(db)?,
        Some(v) if v < schema::CURRENT_VERSION => {
            return Err(CatalogError::NoMigrationPath(v));
        }
        Some(_) => {}
    }
    Ok(())
}

pub fn find_storage_by_id(db: &DatabaseHandle, id: i64) -> Result<Option<Storage>, CatalogError> {
    let mut found = None;
    db.execute(
        "SELECT id, entityId, name, createdDateTime, size, state FROM storages WHERE id=?",
        &[SqlValue::Int(id)],
        Some(|row: &rusqlite::Row| {
            found = Some(Storage {
                id: row.get(0)?,
                entity_id: row.get::<_, Option<i64>>(1)?,
                name: row.get(2)?,
                created_date_time: row.get(3)?,
                size: row.get(4)?,
                state: row.get(5)?,
            });
            Ok(())
        }),
    )?;
    Ok(found)
}

/// Finds an entity with the given job uuid and archive type, used by the
/// v6 migration to re-home orphan storages.
pub fn find_entity(
    db: &DatabaseHandle,
    job_uuid: &str,
    archive_type: Option<i64>,
) -> Result<Option<Entity>, CatalogError> {
    let (where_sql, mut params): (&str, Vec<SqlValue>) = if archive_type.is_some() {
        ("jobUuid=? AND archiveType=?", vec![SqlValue::Text(job_uuid.to_string())])
    } else {
        ("jobUuid=?", vec![SqlValue::Text(job_uuid.to_string())])
    };
    if let Some(t) = archive_type {
        params.push(SqlValue::Int(t));
    }

    let mut found = None;
    db.execute(
        &format!(
            "SELECT id, jobUuid, scheduleUuid, hostName, userName, archiveType, createdDateTime, locked
             FROM entities WHERE {}",
            where_sql
        ),
        &params,
        Some(|row: &rusqlite::Row| {
            found = Some(Entity {
                id: row.get(0)?,
                job_uuid: row.get(1)?,
                schedule_uuid: row.get(2)?,
                host_name: row.get(3)?,
                user_name: row.get(4)?,
                archive_type: row.get(5)?,
                created_date_time: row.get(6)?,
                locked: row.get::<_, i64>(7)? != 0,
            });
            Ok(())
        }),
    )?;
    Ok(found)
}

#[allow(clippy::too_many_arguments)]
pub fn new_entity(
    db: &DatabaseHandle,
    job_uuid: &str,
    schedule_uuid: Option<&str>,
    host_name: Option<&str>,
    user_name: Option<&str>,
    archive_type: i64,
    created_at: i64,
    locked: bool,
) -> Result<i64, CatalogError> {
    db.execute(
        "INSERT INTO entities (jobUuid, scheduleUuid, hostName, userName, archiveType, createdDateTime, locked)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        &[
            SqlValue::Text(job_uuid.to_string()),
            schedule_uuid.map(|s| SqlValue::Text(s.to_string())).unwrap_or(SqlValue::Null),
            host_name.map(|s| SqlValue::Text(s.to_string())).unwrap_or(SqlValue::Null),
            user_name.map(|s| SqlValue::Text(s.to_string())).unwrap_or(SqlValue::Null),
            SqlValue::Int(archive_type),
            SqlValue::Int(created_at),
            SqlValue::Int(locked as i64),
        ],
        None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
    )?;
    Ok(db.last_insert_rowid())
}

pub fn unlock_entity(db: &DatabaseHandle, id: i64) -> Result<(), CatalogError> {
    db.set_i64("entities", "locked", 0, "id=?", &[SqlValue::Int(id)])?;
    Ok(())
}

/// Schema hygiene applied to v1 databases before migration: clears
/// negative or zero ids left behind by a prior buggy insert path, letting
/// SQLite reassign them on the next INSERT.
pub fn fix_broken_ids(db: &DatabaseHandle, table: &str) -> Result<(), CatalogError> {
    db.execute(
        &format!("DELETE FROM {} WHERE id <= 0", table),
        &[],
        None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{OpenFlags, OpenMode};

    fn open_memory() -> DatabaseHandle {
        let db = DatabaseHandle::open(":memory:", OpenMode::Create, OpenFlags { memory: true, ..Default::default() }, None).unwrap();
        schema::ensure_schema(&db).unwrap();
        db
    }

    #[test]
    fn new_entity_find_and_unlock_round_trip() {
        let db = open_memory();
        let id = new_entity(&db, "job-1", None, Some("host"), None, ArchiveType::Full as i64, 1_700_000_000, true).unwrap();

        let found = find_entity(&db, "job-1", Some(ArchiveType::Full as i64)).unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(found.locked);

        unlock_entity(&db, id).unwrap();
        let refreshed = find_entity(&db, "job-1", None).unwrap().unwrap();
        assert!(!refreshed.locked);
    }

    #[test]
    fn find_storage_by_id_returns_none_when_absent() {
        let db = open_memory();
        assert!(find_storage_by_id(&db, 42).unwrap().is_none());
    }

    #[test]
    fn fix_broken_ids_removes_non_positive_rows() {
        let db = open_memory();
        db.execute(
            "INSERT INTO entities (id, jobUuid, archiveType, createdDateTime) VALUES (-1, 'bad', 0, 0)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();
        new_entity(&db, "good", None, None, None, ArchiveType::Normal as i64, 0, false).unwrap();

        fix_broken_ids(&db, "entities").unwrap();

        assert!(find_entity(&db, "bad", None).unwrap().is_none());
        assert!(find_entity(&db, "good", None).unwrap().is_some());
    }

    #[test]
    fn archive_type_round_trips_through_name() {
        for t in ARCHIVE_TYPES {
            assert_eq!(t.name().parse::<ArchiveType>().unwrap(), t);
        }
    }
}
