//! Catalog Index schema: UUID → Entity → Storage → Entry, with
//! per-type specialization tables, laid over the Database Engine.

use crate::database::{DatabaseHandle, SqlValue};
use crate::error::DatabaseError;

/// Current schema version. Databases opened at an older version are run
/// through [`super::migrate::migrate`] before use.
pub const CURRENT_VERSION: u32 = 7;

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (name TEXT PRIMARY KEY, value TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS uuids (uuid TEXT PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS entities (
        id INTEGER PRIMARY KEY,
        jobUuid TEXT NOT NULL,
        scheduleUuid TEXT,
        hostName TEXT,
        userName TEXT,
        archiveType INTEGER NOT NULL,
        createdDateTime INTEGER NOT NULL,
        locked INTEGER NOT NULL DEFAULT 0,
        totalEntryCount INTEGER NOT NULL DEFAULT 0,
        totalEntrySize INTEGER NOT NULL DEFAULT 0,
        lastErrorMessage TEXT
    )",
    "CREATE TABLE IF NOT EXISTS storages (
        id INTEGER PRIMARY KEY,
        entityId INTEGER REFERENCES entities(id),
        name TEXT NOT NULL,
        createdDateTime INTEGER NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        state INTEGER NOT NULL DEFAULT 0,
        mode INTEGER NOT NULL DEFAULT 0,
        lastCheckedDateTime INTEGER,
        errorMessage TEXT,
        totalEntryCount INTEGER NOT NULL DEFAULT 0,
        totalEntrySize INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS entries (
        id INTEGER PRIMARY KEY,
        storageId INTEGER NOT NULL REFERENCES storages(id),
        type INTEGER NOT NULL,
        name TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        timeLastAccess INTEGER,
        timeModified INTEGER,
        timeLastChanged INTEGER,
        userId INTEGER,
        groupId INTEGER,
        permission INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS fileEntries (
        entryId INTEGER PRIMARY KEY REFERENCES entries(id),
        storageId INTEGER NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        fragmentOffset INTEGER NOT NULL DEFAULT 0,
        fragmentSize INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS imageEntries (
        entryId INTEGER PRIMARY KEY REFERENCES entries(id),
        storageId INTEGER NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        fileSystemType INTEGER NOT NULL DEFAULT 0,
        blockSize INTEGER NOT NULL DEFAULT 0,
        blockOffset INTEGER NOT NULL DEFAULT 0,
        blockCount INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS directoryEntries (
        entryId INTEGER PRIMARY KEY REFERENCES entries(id),
        storageId INTEGER NOT NULL,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS linkEntries (
        entryId INTEGER PRIMARY KEY REFERENCES entries(id),
        storageId INTEGER NOT NULL,
        destinationName TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS hardlinkEntries (
        entryId INTEGER PRIMARY KEY REFERENCES entries(id),
        storageId INTEGER NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        fragmentOffset INTEGER NOT NULL DEFAULT 0,
        fragmentSize INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS specialEntries (
        entryId INTEGER PRIMARY KEY REFERENCES entries(id),
        storageId INTEGER NOT NULL,
        specialType INTEGER NOT NULL,
        major INTEGER NOT NULL DEFAULT 0,
        minor INTEGER NOT NULL DEFAULT 0
    )",
];

/// Applies the current DDL to `db`, leaving existing tables untouched
/// (`IF NOT EXISTS`), and stamps `meta.schemaVersion` if absent.
pub fn ensure_schema(db: &DatabaseHandle) -> Result<(), DatabaseError> {
    for stmt in DDL {
        db.execute(stmt, &[], None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>)?;
    }
    if schema_version(db)?.is_none() {
        set_schema_version(db, CURRENT_VERSION)?;
    }
    Ok(())
}

pub fn schema_version(db: &DatabaseHandle) -> Result<Option<u32>, DatabaseError> {
    let mut found = None;
    db.execute(
        "SELECT value FROM meta WHERE name='schemaVersion'",
        &[],
        Some(|row: &rusqlite::Row| {
            let value: String = row.get(0).map_err(DatabaseError::from)?;
            found = value.parse::<u32>().ok();
            Ok(())
        }),
    )?;
    Ok(found)
}

pub fn set_schema_version(db: &DatabaseHandle, version: u32) -> Result<(), DatabaseError> {
    db.execute(
        "INSERT INTO meta (name, value) VALUES ('schemaVersion', ?)
         ON CONFLICT(name) DO UPDATE SET value=excluded.value",
        &[SqlValue::Text(version.to_string())],
        None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
    )?;
    Ok(())
}

/// A single detected difference between a reference and a candidate schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDiff {
    MissingTable(String),
    ObsoleteTable(String),
    MissingColumn { table: String, column: String },
    ObsoleteColumn { table: String, column: String },
    TypeMismatch { table: String, column: String },
}

/// Walks table and column metadata of `reference` against `current`,
/// returning the first difference found, if any.
pub fn compare(reference: &DatabaseHandle, current: &DatabaseHandle) -> Result<Option<SchemaDiff>, DatabaseError> {
    let reference_tables = table_names(reference)?;
    let current_tables = table_names(current)?;

    for table in &reference_tables {
        if !current_tables.contains(table) {
            return Ok(Some(SchemaDiff::MissingTable(table.clone())));
        }
    }
    for table in &current_tables {
        if !reference_tables.contains(table) {
            return Ok(Some(SchemaDiff::ObsoleteTable(table.clone())));
        }
    }

    for table in &reference_tables {
        let reference_columns = column_info(reference, table)?;
        let current_columns = column_info(current, table)?;

        for (name, ty) in &reference_columns {
            match current_columns.iter().find(|(n, _)| n == name) {
                None => {
                    return Ok(Some(SchemaDiff::MissingColumn {
                        table: table.clone(),
                        column: name.clone(),
                    }))
                }
                Some((_, current_ty)) if !ty.eq_ignore_ascii_case(current_ty) => {
                    return Ok(Some(SchemaDiff::TypeMismatch {
                        table: table.clone(),
                        column: name.clone(),
                    }))
                }
                _ => {}
            }
        }
        for (name, _) in &current_columns {
            if !reference_columns.iter().any(|(n, _)| n == name) {
                return Ok(Some(SchemaDiff::ObsoleteColumn {
                    table: table.clone(),
                    column: name.clone(),
                }));
            }
        }
    }

    Ok(None)
}

fn table_names(db: &DatabaseHandle) -> Result<Vec<String>, DatabaseError> {
    let mut names = Vec::new();
    db.execute(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        &[],
        Some(|row: &rusqlite::Row| {
            names.push(row.get::<_, String>(0).map_err(DatabaseError::from)?);
            Ok(())
        }),
    )?;
    Ok(names)
}

fn column_info(db: &DatabaseHandle, table: &str) -> Result<Vec<(String, String)>, DatabaseError> {
    let mut columns = Vec::new();
    db.execute(
        &format!("PRAGMA table_info({})", table),
        &[],
        Some(|row: &rusqlite::Row| {
            let name: String = row.get(1).map_err(DatabaseError::from)?;
            let ty: String = row.get(2).map_err(DatabaseError::from)?;
            columns.push((name, ty));
            Ok(())
        }),
    )?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{OpenFlags, OpenMode};

    fn open_memory() -> DatabaseHandle {
        DatabaseHandle::open(":memory:", OpenMode::Create, OpenFlags { memory: true, ..Default::default() }, None).unwrap()
    }

    #[test]
    fn ensure_schema_stamps_current_version() {
        let db = open_memory();
        ensure_schema(&db).unwrap();
        assert_eq!(schema_version(&db).unwrap(), Some(CURRENT_VERSION));
    }

    #[test]
    fn compare_identical_schemas_is_none() {
        let a = open_memory();
        let b = open_memory();
        ensure_schema(&a).unwrap();
        ensure_schema(&b).unwrap();
        assert_eq!(compare(&a, &b).unwrap(), None);
    }

    #[test]
    fn compare_detects_missing_table() {
        let a = open_memory();
        let b = open_memory();
        ensure_schema(&a).unwrap();
        a.execute("CREATE TABLE extra (id INTEGER)", &[], None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>).unwrap();
        ensure_schema(&b).unwrap();
        assert_eq!(compare(&a, &b).unwrap(), Some(SchemaDiff::MissingTable("extra".to_string())));
    }
}
