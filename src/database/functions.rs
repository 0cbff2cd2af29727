//! Helper SQL functions registered on every connection.
//!
//! `unixtimestamp(text[, format])`, `regexp(pattern, caseSensitive, text)`
//! and `dirname(path)` are implemented as `rusqlite` scalar functions so
//! catalog queries can filter/format dates and paths directly in SQL.

use std::path::Path;

use chrono::NaiveDateTime;
use regex::{Regex, RegexBuilder};
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    register_unixtimestamp(conn)?;
    register_regexp(conn)?;
    register_dirname(conn)?;
    Ok(())
}

fn register_unixtimestamp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "unixtimestamp",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let text: String = ctx.get(0)?;
            let format: Option<String> = if ctx.len() >= 2 {
                Some(ctx.get(1)?)
            } else {
                None
            };
            Ok(unix_timestamp(&text, format.as_deref()))
        },
    )
}

/// Parse `text` into epoch seconds (UTC): a bare numeric literal first,
/// then the given (or default) `strptime`-style format. Unparseable input
/// yields 0.
fn unix_timestamp(text: &str, format: Option<&str>) -> i64 {
    if let Ok(n) = text.trim().parse::<i64>() {
        return n;
    }
    let fmt = format.unwrap_or(DEFAULT_DATETIME_FORMAT);
    match NaiveDateTime::parse_from_str(text, fmt) {
        Ok(dt) => dt.timestamp(),
        Err(_) => 0,
    }
}

/// `regexp(pattern, caseSensitive, text)`. The compiled pattern is cached on
/// the statement's argument-0 auxiliary slot, so a pattern bound once (the
/// common case: a literal in the SQL text) is compiled once per prepared
/// statement rather than once per row.
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        3,
        FunctionFlags::SQLITE_UTF8,
        move |ctx| {
            let case_sensitive: i64 = ctx.get(1)?;
            let text: String = ctx.get(2)?;

            let cached: Option<std::sync::Arc<Regex>> = ctx.get_aux(0)?;
            let regex = match cached {
                Some(re) => Some(re),
                None => {
                    let pattern: String = ctx.get(0)?;
                    match RegexBuilder::new(&pattern)
                        .case_insensitive(case_sensitive == 0)
                        .build()
                    {
                        Ok(compiled) => Some(ctx.set_aux(0, compiled)?),
                        Err(_) => None,
                    }
                }
            };

            Ok(regex.map(|re| re.is_match(&text)).unwrap_or(false) as i64)
        },
    )
}

fn register_dirname(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "dirname",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let path: String = ctx.get(0)?;
            let dir = posix_dirname(&path);
            Ok(dir)
        },
    )
}

fn posix_dirname(path: &str) -> String {
    match Path::new(path).parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
        Some(_) => ".".to_string(),
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unixtimestamp_numeric_literal() {
        assert_eq!(unix_timestamp("1700000000", None), 1_700_000_000);
    }

    #[test]
    fn unixtimestamp_default_format() {
        let ts = unix_timestamp("2023-11-14 22:13:20", None);
        assert_eq!(ts, 1_700_000_000);
    }

    #[test]
    fn unixtimestamp_unparseable_is_zero() {
        assert_eq!(unix_timestamp("not a date", None), 0);
    }

    #[test]
    fn dirname_matches_posix() {
        assert_eq!(posix_dirname("/a/b/c"), "/a/b");
        assert_eq!(posix_dirname("c"), ".");
        assert_eq!(posix_dirname("/c"), "/");
    }
}
