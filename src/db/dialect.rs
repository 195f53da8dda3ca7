//! Transaction-control SQL per backend.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel};

/// Statements that start a transaction, in execution order.
pub fn begin_statements(db: DatabaseType, isolation: IsolationLevel) -> Vec<String> {
    match db {
        DatabaseType::PostgreSQL => {
            // PostgreSQL's REPEATABLE READ is snapshot isolation
            let level = match isolation {
                IsolationLevel::Snapshot => Some("REPEATABLE READ"),
                other => other.sql_name(),
            };
            match level {
                Some(level) => vec![format!("BEGIN ISOLATION LEVEL {level}")],
                None => vec!["BEGIN".to_string()],
            }
        }
        DatabaseType::MySQL => {
            let level = match isolation {
                IsolationLevel::Snapshot => Some("REPEATABLE READ"),
                other => other.sql_name(),
            };
            let mut stmts = Vec::with_capacity(2);
            if let Some(level) = level {
                stmts.push(format!("SET TRANSACTION ISOLATION LEVEL {level}"));
            }
            stmts.push("START TRANSACTION".to_string());
            stmts
        }
        // SQLite is always serializable; the level picks how early the write lock is taken
        DatabaseType::SQLite => {
            let mode = match isolation {
                IsolationLevel::Unspecified
                | IsolationLevel::ReadUncommitted
                | IsolationLevel::ReadCommitted => "DEFERRED",
                IsolationLevel::RepeatableRead | IsolationLevel::Snapshot => "IMMEDIATE",
                IsolationLevel::Serializable => "EXCLUSIVE",
            };
            vec![format!("BEGIN {mode}")]
        }
        DatabaseType::SqlServer => match isolation.sql_name() {
            Some(level) => vec![format!(
                "SET TRANSACTION ISOLATION LEVEL {level}; BEGIN TRANSACTION"
            )],
            None => vec!["BEGIN TRANSACTION".to_string()],
        },
    }
}

pub fn commit_statement(db: DatabaseType) -> &'static str {
    match db {
        DatabaseType::SqlServer => "COMMIT TRANSACTION",
        _ => "COMMIT",
    }
}

pub fn rollback_statement(db: DatabaseType) -> &'static str {
    match db {
        DatabaseType::SqlServer => "ROLLBACK TRANSACTION",
        _ => "ROLLBACK",
    }
}

pub fn savepoint_statement(db: DatabaseType, name: &str) -> DbResult<String> {
    validate_savepoint_name(name)?;
    Ok(match db {
        DatabaseType::SqlServer => format!("SAVE TRANSACTION {name}"),
        _ => format!("SAVEPOINT {name}"),
    })
}

pub fn rollback_to_savepoint_statement(db: DatabaseType, name: &str) -> DbResult<String> {
    validate_savepoint_name(name)?;
    Ok(match db {
        DatabaseType::SqlServer => format!("ROLLBACK TRANSACTION {name}"),
        _ => format!("ROLLBACK TO SAVEPOINT {name}"),
    })
}

/// Savepoint names are interpolated into SQL, so only identifiers are accepted.
pub fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "Invalid savepoint name '{name}': use letters, digits and underscores"
        )))
    }
}
