use anyhow::{Context, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms: base_delay_ms * 30,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.exponential_base.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            let rng_factor = rand::thread_rng().gen_range(0.5..=1.5);
            delay_ms * rng_factor
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// Retries `operation` with exponential delay between attempts.
pub async fn with_retry<T, F, Fut>(
    config: RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt + 1);
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_retries => {
                let error_msg = format!("{}", e);
                return Err(e).context(format!(
                    "{} failed after {} attempts. Last error: {}",
                    operation_name,
                    attempt + 1,
                    error_msg
                ));
            }
            Err(e) => {
                let delay = config.calculate_delay(attempt);
                debug!(
                    "{} failed (attempt {}/{}). Retrying in {:?}: {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry policy that shrinks the size of the requested range instead of
/// waiting between attempts.
#[derive(Debug, Clone, Copy)]
pub struct ShrinkingWindow {
    pub attempts: u32,
    pub shrink_factor: u64,
}

impl Default for ShrinkingWindow {
    fn default() -> Self {
        Self {
            attempts: 3,
            shrink_factor: 2,
        }
    }
}

impl ShrinkingWindow {
    pub fn new(attempts: u32, shrink_factor: u64) -> Self {
        Self {
            attempts,
            shrink_factor,
        }
    }

    /// Window sizes tried in order, e.g. `128000, 64000, 32000`.
    ///
    /// Stops early once the window would shrink to zero.
    pub fn windows(&self, initial: u64) -> Vec<u64> {
        let factor = self.shrink_factor.max(1);
        let mut windows = Vec::with_capacity(self.attempts as usize);
        let mut window = initial;
        for _ in 0..self.attempts {
            if window == 0 {
                break;
            }
            windows.push(window);
            window /= factor;
        }
        windows
    }
}

/// Runs `operation` with successively smaller windows until it succeeds.
///
/// `should_retry` decides whether a failure is worth another, smaller attempt.
/// The last error is returned when every window failed or a failure was
/// rejected by the predicate.
pub async fn with_shrinking_window<T, F, Fut, P>(
    policy: ShrinkingWindow,
    initial_window: u64,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let windows = policy.windows(initial_window);
    let total = windows.len();
    let mut last_error = None;

    for (attempt, window) in windows.into_iter().enumerate() {
        match operation(window).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        "{} succeeded with window {} on attempt {}",
                        operation_name,
                        window,
                        attempt + 1
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                warn!(
                    "{} failed with window {} (attempt {}/{}): {}",
                    operation_name,
                    window,
                    attempt + 1,
                    total,
                    e
                );
                let retry = should_retry(&e);
                last_error = Some(e);
                if !retry {
                    break;
                }
            }
        }
    }

    match last_error {
        Some(e) => Err(e).context(format!("{} gave up", operation_name)),
        None => anyhow::bail!("{} had no window to try", operation_name),
    }
}

/// Kind of a transient failure recognized from an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    RateLimited,
    Connection,
}

pub fn transient_kind(message: &str) -> Option<TransientKind> {
    let message = message.to_lowercase();

    let timeout_patterns = ["timeout", "timed out", "deadline exceeded"];
    let rate_patterns = ["rate limit", "too many requests", "429", "exceeded its compute"];
    let connection_patterns = [
        "connection refused",
        "connection reset",
        "connection closed",
        "network error",
        "temporary failure",
        "service unavailable",
    ];

    if timeout_patterns.iter().any(|p| message.contains(p)) {
        Some(TransientKind::Timeout)
    } else if rate_patterns.iter().any(|p| message.contains(p)) {
        Some(TransientKind::RateLimited)
    } else if connection_patterns.iter().any(|p| message.contains(p)) {
        Some(TransientKind::Connection)
    } else {
        None
    }
}

pub fn is_transient_error(error: &anyhow::Error) -> bool {
    transient_kind(&format!("{:?}", error)).is_some()
}
