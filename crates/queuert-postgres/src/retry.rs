//! Transient-error retry wrapper (`spec.md` §4.1 last paragraph): "the adapter
//! wraps each call in backoff retry filtered by a dialect-specific transient-error
//! predicate."

use std::future::Future;

use queuert_core::RetryConfig;
use tokio::time::sleep;

/// Postgres' own transient-error class: connection loss, pool exhaustion timeouts,
/// and serialization/deadlock failures (SQLSTATE `40001`/`40P01`) are worth retrying;
/// anything else (constraint violations, syntax errors, missing rows) is not.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("55P03")
        ),
        _ => false,
    }
}

pub const MAX_ATTEMPTS: u32 = 5;

/// Runs `op` up to `MAX_ATTEMPTS` times, backing off between attempts per `config`,
/// as long as [`is_transient`] holds for the returned error.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS && is_transient(&err) => {
                let delay = config.delay_ms(attempt as i32).max(0) as u64;
                sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs a single statement already bound to a transaction's connection, retrying
/// it behind a `SAVEPOINT` when [`is_transient`] holds for the error.
///
/// A bare retry of the same statement on an already-failed transaction would just
/// hit Postgres' "current transaction is aborted" error, since one failed
/// statement poisons every later command on that connection until `ROLLBACK`.
/// The savepoint gives the retry somewhere to roll back to without discarding
/// whatever the surrounding transaction already wrote.
///
/// `$stmt` is re-evaluated on every attempt, so it must be an expression that
/// builds and runs a fresh query each time (e.g. `sqlx::query(sql).bind(x).fetch_optional(&mut *conn)`),
/// not a value computed once outside the macro. Evaluates to `Result<T, sqlx::Error>`;
/// callers apply their usual `.map_err(QueuertError::storage)?` to the whole macro call.
#[macro_export]
macro_rules! retry_in_tx {
    ($config:expr, $conn:expr, $stmt:expr) => {{
        let mut attempt: u32 = 1;
        loop {
            if let Err(err) = sqlx::query("SAVEPOINT queuert_retry")
                .execute(&mut *$conn)
                .await
            {
                break Err(err);
            }
            match $stmt.await {
                Ok(value) => {
                    match sqlx::query("RELEASE SAVEPOINT queuert_retry")
                        .execute(&mut *$conn)
                        .await
                    {
                        Ok(_) => break Ok(value),
                        Err(err) => break Err(err),
                    }
                }
                Err(err)
                    if attempt < $crate::retry::MAX_ATTEMPTS
                        && $crate::retry::is_transient(&err) =>
                {
                    if let Err(err) = sqlx::query("ROLLBACK TO SAVEPOINT queuert_retry")
                        .execute(&mut *$conn)
                        .await
                    {
                        break Err(err);
                    }
                    let delay = $config.delay_ms(attempt as i32).max(0) as u64;
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => {
                    let _ = sqlx::query("ROLLBACK TO SAVEPOINT queuert_retry")
                        .execute(&mut *$conn)
                        .await;
                    break Err(err);
                }
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
    }

    #[tokio::test]
    async fn with_retry_succeeds_after_transient_failures() {
        let config = RetryConfig {
            initial_delay_ms: 1,
            multiplier: 1.0,
            max_delay_ms: 5,
        };
        let mut remaining_failures = 2;
        let result = with_retry(&config, || {
            let fail = remaining_failures > 0;
            if fail {
                remaining_failures -= 1;
            }
            async move {
                if fail {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
    }
}
