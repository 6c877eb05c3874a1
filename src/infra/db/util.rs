use crate::application::repos::RepoError;

/// SQLSTATE classes and codes that mean "try again later".
fn is_unavailable_code(code: &str) -> bool {
    // 08: connection exception, 53300: too many connections,
    // 57P01..57P03: admin shutdown, crash shutdown, cannot connect now.
    code.starts_with("08") || matches!(code, "53300" | "57P01" | "57P02" | "57P03")
}

const QUERY_CANCELED: &str = "57014";

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepoError::unavailable(err),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => RepoError::unavailable(err),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|code| code.into_owned()).unwrap_or_default();
            if code == QUERY_CANCELED {
                return RepoError::Timeout;
            }
            if is_unavailable_code(&code) {
                return RepoError::Unavailable(db.message().to_string());
            }
            if db.is_unique_violation() {
                return RepoError::Duplicate {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                };
            }
            if db.is_foreign_key_violation() || code.starts_with("22") {
                return RepoError::InvalidInput {
                    message: db.message().to_string(),
                };
            }
            if db.is_check_violation() || code.starts_with("23") {
                return RepoError::Integrity {
                    message: db.message().to_string(),
                };
            }
            RepoError::Persistence(db.message().to_string())
        }
        other => RepoError::from_persistence(other),
    }
}
