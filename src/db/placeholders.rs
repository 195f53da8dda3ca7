//! Named placeholder translation.
//!
//! Commands are written with `@name` markers. Each backend binds positionally,
//! so markers that match a declared parameter are rewritten into the backend's
//! native form and the parameters are reordered to match.
//!
//! Quoted strings, quoted identifiers, comments and dollar-quoted blocks are
//! skipped by a small state machine. `@@name` (SQL Server system variables) and
//! markers that match no declared parameter (MySQL user variables, T-SQL locals)
//! are left untouched.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Parameter, SqlType};

/// Native positional placeholder form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// PostgreSQL `$1`.
    Dollar,
    /// MySQL `?`, one bind per occurrence.
    Question,
    /// SQLite `?1`.
    NumberedQuestion,
    /// SQL Server (tiberius) `@P1`.
    AtP,
}

impl PlaceholderStyle {
    pub fn for_database(db: DatabaseType) -> Self {
        match db {
            DatabaseType::PostgreSQL => Self::Dollar,
            DatabaseType::MySQL => Self::Question,
            DatabaseType::SQLite => Self::NumberedQuestion,
            DatabaseType::SqlServer => Self::AtP,
        }
    }

    fn write(&self, buf: &mut String, position: usize) {
        match self {
            Self::Dollar => {
                buf.push('$');
                buf.push_str(&position.to_string());
            }
            Self::Question => buf.push('?'),
            Self::NumberedQuestion => {
                buf.push('?');
                buf.push_str(&position.to_string());
            }
            Self::AtP => {
                buf.push_str("@P");
                buf.push_str(&position.to_string());
            }
        }
    }
}

/// Result of translating a command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translated {
    pub sql: String,
    /// Indexes into the declared parameters, in bind order.
    pub bind_order: Vec<usize>,
}

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    Bracketed,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        // tags cannot start with a digit, which keeps `$1` a placeholder
        if !is_ident_byte(b) || (idx == start + 1 && b.is_ascii_digit()) {
            return None;
        }
        idx += 1;
    }
    if idx < bytes.len() {
        let tag = std::str::from_utf8(&bytes[start + 1..idx]).ok()?.to_string();
        Some((tag, idx))
    } else {
        None
    }
}

fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    end < bytes.len() && &bytes[idx + 1..end] == tag.as_bytes() && bytes[end] == b'$'
}

/// Rewrite `@name` markers into `style` placeholders.
///
/// When the text contains no marker for any declared parameter, the text is
/// assumed to already use native positional placeholders and every parameter
/// is bound in declaration order.
pub fn translate_named(
    sql: &str,
    params: &[Parameter],
    style: PlaceholderStyle,
) -> DbResult<Translated> {
    if params.is_empty() {
        return Ok(Translated {
            sql: sql.to_string(),
            bind_order: Vec::new(),
        });
    }
    check_unique_names(params)?;

    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut bind_order = Vec::new();
    // declared index -> assigned position, for numbered styles
    let mut positions: Vec<Option<usize>> = vec![None; params.len()];
    let mut state = State::Normal;
    let mut copied = 0;
    let mut idx = 0;
    let mut replaced_any = false;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'`' => state = State::Backtick,
                b'[' if style == PlaceholderStyle::AtP => state = State::Bracketed,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => {
                    state = State::BlockComment(1);
                    idx += 1;
                }
                b'$' if idx == 0 || !is_ident_byte(bytes[idx - 1]) => {
                    if let Some((tag, advance)) = try_start_dollar_quote(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        idx = advance;
                    }
                }
                b'@' if bytes.get(idx + 1) == Some(&b'@') => {
                    // system variable: skip the whole identifier
                    idx += 2;
                    while idx < bytes.len() && is_ident_byte(bytes[idx]) {
                        idx += 1;
                    }
                    continue;
                }
                b'@' if idx == 0 || !is_ident_byte(bytes[idx - 1]) => {
                    let start = idx + 1;
                    let mut end = start;
                    while end < bytes.len() && is_ident_byte(bytes[end]) {
                        end += 1;
                    }
                    let name = &sql[start..end];
                    if let Some(pidx) = (!name.is_empty())
                        .then(|| params.iter().position(|p| p.name.eq_ignore_ascii_case(name)))
                        .flatten()
                    {
                        out.push_str(&sql[copied..idx]);
                        let position = match style {
                            PlaceholderStyle::Question => {
                                bind_order.push(pidx);
                                bind_order.len()
                            }
                            _ => match positions[pidx] {
                                Some(p) => p,
                                None => {
                                    bind_order.push(pidx);
                                    positions[pidx] = Some(bind_order.len());
                                    bind_order.len()
                                }
                            },
                        };
                        style.write(&mut out, position);
                        // text-bound decimals need an explicit cast on PostgreSQL
                        if style == PlaceholderStyle::Dollar
                            && params[pidx].effective_type() == Some(SqlType::Decimal)
                        {
                            out.push_str("::numeric");
                        }
                        copied = end;
                        replaced_any = true;
                    }
                    idx = end;
                    continue;
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::Backtick => {
                if b == b'`' {
                    state = State::Normal;
                }
            }
            State::Bracketed => {
                if b == b']' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    idx += 1;
                } else if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    idx += 1;
                }
            }
            State::DollarQuoted(ref tag) => {
                if b == b'$' && matches_tag(bytes, idx, tag) {
                    idx += tag.len() + 1;
                    state = State::Normal;
                }
            }
        }
        idx += 1;
    }

    if !replaced_any {
        return Ok(Translated {
            sql: sql.to_string(),
            bind_order: (0..params.len()).collect(),
        });
    }

    out.push_str(&sql[copied..]);
    Ok(Translated {
        sql: out,
        bind_order,
    })
}

fn check_unique_names(params: &[Parameter]) -> DbResult<()> {
    for (i, p) in params.iter().enumerate() {
        if p.name.is_empty() {
            continue;
        }
        if params[..i]
            .iter()
            .any(|q| q.name.eq_ignore_ascii_case(&p.name))
        {
            return Err(DbError::invalid_input(format!(
                "Parameter '{}' is declared more than once",
                p.name
            )));
        }
    }
    Ok(())
}
