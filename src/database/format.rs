//! SQL text mini-formatter.
//!
//! A small `printf`-style substitution used wherever the engine builds SQL
//! text directly rather than through a parameterized statement (mostly
//! schema DDL and diagnostics; user data always goes through bound
//! parameters in [`super::handle`]). Supported directives:
//!
//! - `%d` / `%u` (optionally prefixed `l`/`ll`) — integer, inserted verbatim
//! - `%s` / `%S` — C-string / owned string, inserted verbatim
//! - `%'s` / `%'S` — same, but single-quoted with interior `'` doubled
//! - `\c` — escapes any following character literally
//!
//! Unrecognized `%` directives are copied through unchanged.

#[derive(Debug, Clone)]
pub enum SqlArg<'a> {
    Int(i64),
    UInt(u64),
    Str(&'a str),
}

pub fn format_sql(template: &str, args: &[SqlArg]) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars().peekable();
    let mut arg_iter = args.iter();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '%' => {
                let mut quote = false;
                let mut c2 = chars.next();
                if c2 == Some('\'') {
                    quote = true;
                    c2 = chars.next();
                }
                // Skip length modifiers l/ll before d/u.
                while c2 == Some('l') {
                    c2 = chars.next();
                }
                match c2 {
                    Some('d') | Some('u') => {
                        if let Some(arg) = arg_iter.next() {
                            out.push_str(&format_int(arg));
                        }
                    }
                    Some('s') | Some('S') => {
                        if let Some(arg) = arg_iter.next() {
                            let s = format_str(arg);
                            if quote {
                                out.push('\'');
                                out.push_str(&s.replace('\'', "''"));
                                out.push('\'');
                            } else {
                                out.push_str(&s);
                            }
                        }
                    }
                    Some(other) => {
                        out.push('%');
                        if quote {
                            out.push('\'');
                        }
                        out.push(other);
                    }
                    None => {
                        out.push('%');
                        if quote {
                            out.push('\'');
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }

    out
}

fn format_int(arg: &SqlArg) -> String {
    match arg {
        SqlArg::Int(v) => v.to_string(),
        SqlArg::UInt(v) => v.to_string(),
        SqlArg::Str(s) => (*s).to_string(),
    }
}

fn format_str(arg: &SqlArg) -> String {
    match arg {
        SqlArg::Str(s) => (*s).to_string(),
        SqlArg::Int(v) => v.to_string(),
        SqlArg::UInt(v) => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_substitution() {
        let s = format_sql("SELECT * FROM t WHERE id=%d", &[SqlArg::Int(42)]);
        assert_eq!(s, "SELECT * FROM t WHERE id=42");
    }

    #[test]
    fn quoted_string_escapes_interior_quotes() {
        let s = format_sql("INSERT INTO t (name) VALUES (%'s)", &[SqlArg::Str("o'brien")]);
        assert_eq!(s, "INSERT INTO t (name) VALUES ('o''brien')");
    }

    #[test]
    fn long_length_modifier() {
        let s = format_sql("LIMIT %lld", &[SqlArg::Int(7)]);
        assert_eq!(s, "LIMIT 7");
    }

    #[test]
    fn backslash_escapes_any_character() {
        let s = format_sql(r"100\%", &[]);
        assert_eq!(s, "100%");
    }
}
