//! Database metrics collection.

use metrics::{gauge, histogram};
use sqlx::PgPool;
use std::time::Instant;

/// Record database query duration.
pub fn record_query_duration(query_name: &str, outcome: &'static str, duration_secs: f64) {
    histogram!(
        "database_query_duration_seconds",
        "query" => query_name.to_string(),
        "outcome" => outcome
    )
    .record(duration_secs);
}

/// Record database connection pool metrics.
///
/// Called periodically by the pool metrics job.
pub fn record_pool_metrics(pool: &PgPool) {
    let size = pool.size() as usize;
    let idle = pool.num_idle();
    let active = size.saturating_sub(idle);

    gauge!("database_connections_active").set(active as f64);
    gauge!("database_connections_idle").set(idle as f64);
    gauge!("database_connections_total").set(size as f64);
}

/// Times one query and records it, labelled by whether it succeeded.
///
/// ```ignore
/// let timer = QueryTimer::new("find_device_by_id");
/// let result = sqlx::query_as::<_, DeviceEntity>(...).fetch_optional(&pool).await;
/// timer.observe(&result);
/// result
/// ```
pub struct QueryTimer {
    query_name: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn new(query_name: &'static str) -> Self {
        Self {
            query_name,
            start: Instant::now(),
        }
    }

    pub fn observe<T>(self, result: &Result<T, sqlx::Error>) {
        let outcome = outcome_label(result);
        record_query_duration(self.query_name, outcome, self.start.elapsed().as_secs_f64());
    }
}

fn outcome_label<T>(result: &Result<T, sqlx::Error>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(sqlx::Error::RowNotFound) => "not_found",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_timer_creation() {
        let timer = QueryTimer::new("find_device_by_id");
        assert_eq!(timer.query_name, "find_device_by_id");
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&Ok::<_, sqlx::Error>(1)), "ok");
        assert_eq!(outcome_label::<()>(&Err(sqlx::Error::RowNotFound)), "not_found");
        assert_eq!(outcome_label::<()>(&Err(sqlx::Error::PoolTimedOut)), "error");
    }
}
