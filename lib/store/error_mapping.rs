use std::error::Error as StdError;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::deadpool::PoolError;
use diesel_async::pooled_connection::PoolError as ManagerError;

use super::StoreError;

/// Classifies a diesel failure. Connection-level failures are retryable (the retry runs on a
/// fresh pooled connection); everything else is fatal for the current operation.
pub fn map_diesel_error(error: DieselError) -> StoreError {
    match error {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand => {
                StoreError::Connection(format!("{kind:?}: {}", info.message()))
            }
            _ => StoreError::Database(format!("{kind:?}: {}", info.message())),
        },
        DieselError::BrokenTransactionManager => {
            StoreError::Connection("connection left in a broken transaction state".to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

/// Only a checkout timeout or a closed pool is retryable. Failures raised while the manager
/// opens a connection are classified like any other diesel failure.
pub fn map_pool_error(error: PoolError) -> StoreError {
    match error {
        retryable @ (PoolError::Timeout(_) | PoolError::Closed) => {
            StoreError::Pool(retryable.to_string())
        }
        PoolError::Backend(ManagerError::QueryError(inner)) => map_diesel_error(inner),
        PoolError::Backend(ManagerError::ConnectionError(inner)) => {
            StoreError::Database(format!("could not open connection: {inner}"))
        }
        other => StoreError::Database(other.to_string()),
    }
}

/// Classifies a reqwest failure: transport-level problems and 5xx answers are retryable,
/// anything else is a malformed exchange.
pub fn map_reqwest_error(error: reqwest::Error) -> StoreError {
    if let Some(status) = error.status() {
        if status.is_server_error() {
            return StoreError::Connection(format!("upstream returned {status}"));
        }
        return StoreError::Rejected {
            code: i64::from(status.as_u16()),
            desc: format!("unexpected HTTP status {status}"),
        };
    }

    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        return StoreError::Connection(describe_chain(&error));
    }

    StoreError::Decode(describe_chain(&error))
}

/// Flattens an error and its sources onto one line so nested socket/DNS causes survive.
fn describe_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Info(&'static str);

    impl diesel::result::DatabaseErrorInformation for Info {
        fn message(&self) -> &str {
            self.0
        }
        fn details(&self) -> Option<&str> {
            None
        }
        fn hint(&self) -> Option<&str> {
            None
        }
        fn table_name(&self) -> Option<&str> {
            None
        }
        fn column_name(&self) -> Option<&str> {
            None
        }
        fn constraint_name(&self) -> Option<&str> {
            None
        }
        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    #[test]
    fn closed_connection_is_retryable() {
        let mapped = map_diesel_error(DieselError::DatabaseError(
            DatabaseErrorKind::ClosedConnection,
            Box::new(Info("server has gone away")),
        ));
        assert!(mapped.is_retryable());
    }

    #[test]
    fn constraint_violation_is_fatal() {
        let mapped = map_diesel_error(DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            Box::new(Info("Duplicate entry '3' for key 'PRIMARY'")),
        ));
        assert!(!mapped.is_retryable());
        assert!(mapped.to_string().contains("Duplicate entry"));
    }

    #[test]
    fn not_found_is_fatal() {
        assert!(!map_diesel_error(DieselError::NotFound).is_retryable());
    }

    #[test]
    fn rejected_credentials_are_fatal() {
        let mapped = map_pool_error(PoolError::Backend(ManagerError::ConnectionError(
            diesel::ConnectionError::BadConnection("Access denied for user 'sync'".to_string()),
        )));
        assert!(!mapped.is_retryable());
        assert!(mapped.to_string().contains("Access denied"));
    }

    #[test]
    fn query_failure_during_checkout_uses_diesel_rules() {
        let mapped = map_pool_error(PoolError::Backend(ManagerError::QueryError(
            DieselError::DatabaseError(
                DatabaseErrorKind::ClosedConnection,
                Box::new(Info("server has gone away")),
            ),
        )));
        assert!(mapped.is_retryable());
        assert!(!map_pool_error(PoolError::Backend(ManagerError::QueryError(
            DieselError::NotFound
        )))
        .is_retryable());
    }

    #[test]
    fn closed_pool_is_retryable() {
        assert!(matches!(
            map_pool_error(PoolError::Closed),
            StoreError::Pool(_)
        ));
    }
}
