//! Streaming query cursor.
//!
//! A `QueryHandle` wraps a prepared statement and drives it row by row, in
//! contrast to [`super::handle::DatabaseHandle::execute`] which consumes the
//! whole result through a callback. It holds the node's read lock for as
//! long as it is alive, released on [`QueryHandle::finalize`] or drop.

use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;

use crate::error::DatabaseError;

use super::handle::DatabaseHandle;
use super::node::LockType;

/// A bound SQL parameter value, independent of the C-style `%d`/`%s`
/// formatter in [`super::format`] — this is always sent through
/// `rusqlite`'s parameter binding, never string-interpolated.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Int(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub(crate) fn to_sql_output(&self) -> ToSqlOutput<'_> {
        match self {
            SqlValue::Null => ToSqlOutput::from(rusqlite::types::Null),
            SqlValue::Int(v) => ToSqlOutput::from(*v),
            SqlValue::Double(v) => ToSqlOutput::from(*v),
            SqlValue::Text(s) => ToSqlOutput::from(s.as_str()),
            SqlValue::Blob(b) => ToSqlOutput::from(b.as_slice()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.to_sql_output())
    }
}

/// A row returned by [`QueryHandle::next_row`], offering typed column
/// extraction by index.
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_i64(&self, index: usize) -> Result<i64, DatabaseError> {
        match self.values.get(index) {
            Some(SqlValue::Int(v)) => Ok(*v),
            Some(SqlValue::Double(v)) => Ok(*v as i64),
            Some(SqlValue::Null) | None => Ok(0),
            Some(other) => Err(DatabaseError::TypeMismatch(format!("{:?}", other))),
        }
    }

    pub fn get_f64(&self, index: usize) -> Result<f64, DatabaseError> {
        match self.values.get(index) {
            Some(SqlValue::Double(v)) => Ok(*v),
            Some(SqlValue::Int(v)) => Ok(*v as f64),
            Some(SqlValue::Null) | None => Ok(0.0),
            Some(other) => Err(DatabaseError::TypeMismatch(format!("{:?}", other))),
        }
    }

    pub fn get_string(&self, index: usize) -> Result<String, DatabaseError> {
        match self.values.get(index) {
            Some(SqlValue::Text(s)) => Ok(s.clone()),
            Some(SqlValue::Null) | None => Ok(String::new()),
            Some(SqlValue::Int(v)) => Ok(v.to_string()),
            Some(SqlValue::Double(v)) => Ok(v.to_string()),
            Some(other) => Err(DatabaseError::TypeMismatch(format!("{:?}", other))),
        }
    }

    pub fn get_bool(&self, index: usize) -> Result<bool, DatabaseError> {
        Ok(self.get_i64(index)? != 0)
    }

    pub fn get_blob(&self, index: usize) -> Result<Vec<u8>, DatabaseError> {
        match self.values.get(index) {
            Some(SqlValue::Blob(b)) => Ok(b.clone()),
            Some(SqlValue::Null) | None => Ok(Vec::new()),
            Some(other) => Err(DatabaseError::TypeMismatch(format!("{:?}", other))),
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(SqlValue::Null) | None)
    }
}

fn column_to_value(value: rusqlite::types::ValueRef) -> SqlValue {
    match value {
        rusqlite::types::ValueRef::Null => SqlValue::Null,
        rusqlite::types::ValueRef::Integer(i) => SqlValue::Int(i),
        rusqlite::types::ValueRef::Real(f) => SqlValue::Double(f),
        rusqlite::types::ValueRef::Text(t) => {
            SqlValue::Text(String::from_utf8_lossy(t).into_owned())
        }
        rusqlite::types::ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

pub struct QueryHandle<'h> {
    handle: &'h DatabaseHandle,
    // `rows` borrows `*stmt` and must be dropped before it, hence its
    // position above `stmt` in this struct: fields drop in declaration
    // order. `stmt` is boxed so its heap address stays fixed no matter
    // where the `QueryHandle` value itself is moved to.
    rows: Option<rusqlite::Rows<'h>>,
    stmt: Box<rusqlite::Statement<'h>>,
    column_count: usize,
    finalized: bool,
}

impl<'h> QueryHandle<'h> {
    pub(crate) fn new(
        handle: &'h DatabaseHandle,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Self, DatabaseError> {
        let mut stmt = Box::new(handle.conn.prepare(sql).map_err(DatabaseError::from)?);
        let column_count = stmt.column_count();
        for (i, param) in params.iter().enumerate() {
            stmt.raw_bind_parameter(i + 1, param)
                .map_err(DatabaseError::from)?;
        }

        // SAFETY: `stmt` lives in this box for as long as `rows` does (see
        // the field order above), so stepping through the pointer here
        // outlives the borrow the compiler would otherwise tie to this
        // local `&mut stmt`. Nothing else ever takes a reference into `stmt`
        // while `rows` is alive.
        let stmt_ptr: *mut rusqlite::Statement<'h> = &mut *stmt;
        let rows = unsafe { (*stmt_ptr).raw_query() };

        Ok(QueryHandle {
            handle,
            rows: Some(rows),
            stmt,
            column_count,
            finalized: false,
        })
    }

    /// Steps the cursor once, returning the next row or `None` at EOF.
    ///
    /// Reuses the same underlying `rusqlite::Rows` across calls: creating a
    /// fresh one per call would drop the previous one, and `Rows::drop`
    /// resets the statement, restarting the cursor from the first row.
    pub fn next_row(&mut self) -> Result<Option<Row>, DatabaseError> {
        let rows = self
            .rows
            .as_mut()
            .expect("QueryHandle::next_row called after finalize");
        match rows.next().map_err(DatabaseError::from)? {
            Some(row) => {
                let mut values = Vec::with_capacity(self.column_count);
                for i in 0..self.column_count {
                    let v = row.get_ref(i).map_err(DatabaseError::from)?;
                    values.push(column_to_value(v));
                }
                Ok(Some(Row { values }))
            }
            None => Ok(None),
        }
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn finalize(mut self) {
        self.finalized = true;
        self.handle.unlock(LockType::Read);
    }
}

impl<'h> Drop for QueryHandle<'h> {
    fn drop(&mut self) {
        if !self.finalized {
            self.handle.unlock(LockType::Read);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::handle::{OpenFlags, OpenMode};

    fn open_memory() -> DatabaseHandle {
        DatabaseHandle::open(":memory:", OpenMode::Create, OpenFlags { memory: true, ..Default::default() }, None).unwrap()
    }

    /// Regression test: `next_row` must advance the cursor row by row and
    /// terminate at EOF, not keep re-returning the first row forever.
    #[test]
    fn next_row_streams_every_row_then_ends() {
        let db = open_memory();
        db.execute(
            "CREATE TABLE t (v INTEGER)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
        )
        .unwrap();
        for v in [1, 2, 3] {
            db.execute(
                "INSERT INTO t (v) VALUES (?)",
                &[SqlValue::Int(v)],
                None::<fn(&rusqlite::Row) -> Result<(), DatabaseError>>,
            )
            .unwrap();
        }

        let mut q = db.prepare("SELECT v FROM t ORDER BY v", &[]).unwrap();
        let mut seen = Vec::new();
        while let Some(row) = q.next_row().unwrap() {
            seen.push(row.get_i64(0).unwrap());
        }

        assert_eq!(seen, vec![1, 2, 3]);
        // a further call past EOF must not resurrect row 0.
        assert!(q.next_row().unwrap().is_none());
    }
}
