use std::time::Duration;

use futures::Future;

/// Runs `op` up to `times` times, sleeping `spacing` between failed attempts,
/// and returns the first success or the last error.
pub async fn retry_async<F: FnMut() -> Fut, Fut: Future<Output = Result<T, E>>, T, E>(
    times: usize,
    spacing: Option<Duration>,
    mut op: F,
) -> Result<T, E> {
    let mut result = op().await;
    let mut tries = 1;

    while tries < times.max(1) && result.is_err() {
        if let Some(spacing) = spacing {
            tokio::time::sleep(spacing).await;
        }

        result = op().await;
        tries += 1;
    }

    result
}

/// Converts a configured number of seconds into a duration, treating
/// negative and non-finite values as zero.
pub fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
