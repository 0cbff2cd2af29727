//! Versioned forward migration pipeline.
//!
//! Migrations are a flat registry keyed by the version they migrate
//! *from*, each a plain function rather than branches in one monolithic
//! routine, so a new legacy format can be supported by adding one entry
//! (see DESIGN.md).

mod v1;
mod v6;

use crate::database::DatabaseHandle;
use crate::error::CatalogError;

use super::schema;

type MigrationFn = fn(&DatabaseHandle, &DatabaseHandle) -> Result<(), CatalogError>;

const MIGRATIONS: &[(u32, MigrationFn)] = &[(1, v1::migrate), (6, v6::migrate)];

/// Migrates `old` (at its stored schema version) forward into a freshly
/// schema'd `new`, in ascending `fromVersion` order. `new` must already
/// have the current DDL applied via [`schema::ensure_schema`].
pub fn migrate(old: &DatabaseHandle, new: &DatabaseHandle) -> Result<(), CatalogError> {
    let from_version = schema::schema_version(old)?.unwrap_or(1);

    let handler = MIGRATIONS
        .iter()
        .find(|(v, _)| *v == from_version)
        .map(|(_, f)| *f)
        .ok_or(CatalogError::NoMigrationPath(from_version))?;

    handler(old, new)?;
    schema::set_schema_version(new, schema::CURRENT_VERSION)?;
    Ok(())
}
