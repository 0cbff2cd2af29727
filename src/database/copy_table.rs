//! Table-copy primitive, used by catalog migration (C4) to move
//! rows from an old-schema table into its replacement.
//!
//! Columns are matched by name between the source and destination table;
//! the destination's primary key is never copied, letting the target
//! assign a fresh row id. Callers hook `pre_row`/`post_row` to transform or
//! reject rows in flight, and a `pause` predicate that, when it returns
//! true, commits the in-progress transaction, sleeps in a poll loop, then
//! reopens a fresh one -- so a long copy can be throttled without holding
//! locks indefinitely.

use std::thread;
use std::time::Duration;

use crate::error::DatabaseError;

use super::handle::{DatabaseHandle, TransactionType};
use super::query::SqlValue;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One row read from the source table, by column name.
pub struct SourceRow {
    pub columns: Vec<(String, SqlValue)>,
}

impl SourceRow {
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

pub type PreRowFn<'a> = dyn FnMut(&SourceRow) -> Result<Option<SourceRow>, DatabaseError> + 'a;
pub type PostRowFn<'a> = dyn FnMut(&SourceRow, i64) -> Result<(), DatabaseError> + 'a;
pub type PauseFn<'a> = dyn FnMut() -> bool + 'a;

pub struct CopyTableOptions<'a> {
    pub transactional: bool,
    pub from_additional: Option<String>,
    pub pre_row: Option<Box<PreRowFn<'a>>>,
    pub post_row: Option<Box<PostRowFn<'a>>>,
    pub pause: Option<Box<PauseFn<'a>>>,
}

impl<'a> Default for CopyTableOptions<'a> {
    fn default() -> Self {
        CopyTableOptions {
            transactional: true,
            from_additional: None,
            pre_row: None,
            post_row: None,
            pause: None,
        }
    }
}

/// Copies every row of `from_table` (in `from_handle`) into `to_table` (in
/// `to_handle`), matching columns by name and skipping the destination
/// primary key so a new one is assigned per row. Returns the number of
/// rows copied.
pub fn copy_table(
    from_handle: &DatabaseHandle,
    to_handle: &DatabaseHandle,
    from_table: &str,
    to_table: &str,
    mut options: CopyTableOptions,
) -> Result<u64, DatabaseError> {
    let from_columns = from_handle.table_columns(from_table)?;
    if from_columns.is_empty() {
        return Err(DatabaseError::MissingTable(from_table.to_string()));
    }
    let to_columns = to_handle.table_columns(to_table)?;
    if to_columns.is_empty() {
        return Err(DatabaseError::MissingTable(to_table.to_string()));
    }

    let select_sql = format!(
        "SELECT {} FROM {}{}",
        from_columns.join(", "),
        from_table,
        options
            .from_additional
            .as_ref()
            .map(|s| format!(" {}", s))
            .unwrap_or_default(),
    );

    let _from_guard = from_handle.lock_read_scope()?;
    let mut to_tx_guard = if options.transactional {
        Some(to_handle.begin_tx(TransactionType::Deferred, None)?)
    } else {
        None
    };

    let mut query = from_handle.prepare(&select_sql, &[])?;
    let mut copied = 0u64;

    while let Some(row) = query.next_row()? {
        let mut source = SourceRow { columns: Vec::with_capacity(from_columns.len()) };
        for (i, name) in from_columns.iter().enumerate() {
            let value = if row.is_null(i) {
                SqlValue::Null
            } else {
                row.get_string(i).map(SqlValue::Text)?
            };
            source.columns.push((name.clone(), value));
        }

        let effective_row = match options.pre_row.as_mut() {
            Some(f) => match f(&source)? {
                Some(replaced) => replaced,
                None => continue,
            },
            None => source,
        };

        let insert_columns: Vec<&str> = to_columns
            .iter()
            .filter(|c| c.as_str() != "id" && effective_row.get(c).is_some())
            .map(|c| c.as_str())
            .collect();

        let column_list = insert_columns.join(", ");
        let placeholders = insert_columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            to_table, column_list, placeholders
        );

        let values: Vec<SqlValue> = insert_columns
            .iter()
            .map(|c| effective_row.get(c).cloned().unwrap_or(SqlValue::Null))
            .collect();

        to_handle.execute(&insert_sql, &values, None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>)?;
        let last_row_id = to_handle.conn.last_insert_rowid();
        copied += 1;

        if let Some(f) = options.post_row.as_mut() {
            f(&effective_row, last_row_id)?;
        }

        if let Some(pause) = options.pause.as_mut() {
            if pause() {
                if let Some(tx) = to_tx_guard.take() {
                    tx.commit()?;
                }
                while pause() {
                    thread::sleep(PAUSE_POLL_INTERVAL);
                }
                if options.transactional {
                    to_tx_guard = Some(to_handle.begin_tx(TransactionType::Deferred, None)?);
                }
            }
        }
    }

    drop(query);
    if let Some(tx) = to_tx_guard {
        tx.commit()?;
    }

    Ok(copied)
}
