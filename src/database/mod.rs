//! Database Engine: a multi-threaded wrapper around an embedded
//! SQL store (SQLite via `rusqlite`) providing read/read-write/transaction
//! locking, busy/progress/interrupt handling, WAL checkpointing, and a
//! table-copy primitive used by catalog migration.

mod copy_table;
mod format;
mod functions;
mod handle;
mod node;
mod query;

pub use copy_table::{copy_table, CopyTableOptions, SourceRow};
pub use format::{format_sql, SqlArg};
pub use handle::{DatabaseHandle, OpenFlags, OpenMode, ReadGuard, RwGuard, Transaction, TransactionType};
pub use node::{DatabaseNode, DatabaseRegistry, LockType, REGISTRY};
pub use query::{QueryHandle, Row, SqlValue};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open_memory() -> DatabaseHandle {
        DatabaseHandle::open(
            ":memory:",
            OpenMode::Create,
            OpenFlags { memory: true, ..Default::default() },
            Some(Duration::from_secs(5)),
        )
        .expect("open in-memory database")
    }

    #[test]
    fn execute_and_query_round_trip() {
        let db = open_memory();
        db.execute(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();
        db.execute(
            "INSERT INTO t (name) VALUES (?)",
            &[SqlValue::Text("alpha".into())],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();

        let mut q = db.prepare("SELECT id, name FROM t", &[]).unwrap();
        let row = q.next_row().unwrap().expect("one row");
        assert_eq!(row.get_i64(0).unwrap(), 1);
        assert_eq!(row.get_string(1).unwrap(), "alpha");
        assert!(q.next_row().unwrap().is_none());
    }

    #[test]
    fn exists_and_get_id_wrappers() {
        let db = open_memory();
        db.execute(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();
        db.execute(
            "INSERT INTO t (name) VALUES ('bravo')",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();

        assert!(db.exists("t", "name=?", &[SqlValue::Text("bravo".into())]).unwrap());
        assert!(!db.exists("t", "name=?", &[SqlValue::Text("charlie".into())]).unwrap());

        let id = db
            .get_id("t", "id", "name=?", &[SqlValue::Text("bravo".into())])
            .unwrap();
        assert_eq!(id, Some(1));
    }

    #[test]
    fn transaction_commit_and_rollback() {
        let db = open_memory();
        db.execute(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, n INTEGER)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();

        let tx = db.begin_tx(TransactionType::Immediate, None).unwrap();
        db.execute(
            "INSERT INTO t (n) VALUES (1)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();
        tx.commit().unwrap();

        let tx = db.begin_tx(TransactionType::Immediate, None).unwrap();
        db.execute(
            "INSERT INTO t (n) VALUES (2)",
            &[],
            None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
        )
        .unwrap();
        tx.rollback().unwrap();

        assert!(!db.exists("t", "n=2", &[]).unwrap());
        assert!(db.exists("t", "n=1", &[]).unwrap());
    }

    #[test]
    fn reader_and_writer_fairness() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fairness.db");
        let setup = DatabaseHandle::open(&path, OpenMode::Create, OpenFlags::default(), None).unwrap();
        setup
            .execute(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, n INTEGER)",
                &[],
                None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
            )
            .unwrap();
        drop(setup);

        let barrier = Arc::new(Barrier::new(2));
        let path_reader = path.clone();
        let barrier_reader = barrier.clone();
        let reader = thread::spawn(move || {
            let db = DatabaseHandle::open(&path_reader, OpenMode::ReadWrite, OpenFlags::default(), Some(Duration::from_secs(5))).unwrap();
            let _guard = db.lock_read_scope().unwrap();
            barrier_reader.wait();
            thread::sleep(Duration::from_millis(50));
        });

        let path_writer = path.clone();
        let writer = thread::spawn(move || {
            let db = DatabaseHandle::open(&path_writer, OpenMode::ReadWrite, OpenFlags::default(), Some(Duration::from_secs(5))).unwrap();
            barrier.wait();
            let _guard = db.lock_rw_scope().unwrap();
        });

        reader.join().unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn copy_table_matches_columns_by_name() {
        let from_db = open_memory();
        from_db
            .execute(
                "CREATE TABLE src (id INTEGER PRIMARY KEY, name TEXT, extra TEXT)",
                &[],
                None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
            )
            .unwrap();
        from_db
            .execute(
                "INSERT INTO src (name, extra) VALUES ('a', 'x')",
                &[],
                None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
            )
            .unwrap();

        let to_db = open_memory();
        to_db
            .execute(
                "CREATE TABLE dst (id INTEGER PRIMARY KEY, name TEXT)",
                &[],
                None::<fn(&rusqlite::Row) -> Result<(), crate::error::DatabaseError>>,
            )
            .unwrap();

        let copied = copy_table(
            &from_db,
            &to_db,
            "src",
            "dst",
            CopyTableOptions::default(),
        )
        .unwrap();

        assert_eq!(copied, 1);
        assert!(to_db.exists("dst", "name=?", &[SqlValue::Text("a".into())]).unwrap());
    }
}
