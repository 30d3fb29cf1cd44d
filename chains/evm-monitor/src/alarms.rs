use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Named periodic jobs sharing one cancellation token.
///
/// A handler that has started always runs to completion; cancellation only
/// prevents the next tick.
#[derive(Debug, Default)]
pub struct AlarmScheduler {
    token: CancellationToken,
    alarms: Vec<(&'static str, JoinHandle<()>)>,
}

impl AlarmScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        fire_immediately: bool,
        handler: F,
    ) where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let token = self.token.child_token();

        let handle = tokio::spawn(async move {
            let first = if fire_immediately {
                Instant::now()
            } else {
                Instant::now() + period
            };
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                debug!("Alarm {} fired", name);
                handler().await;
            }
            debug!("Alarm {} stopped", name);
        });

        self.alarms.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    /// Cancels every alarm and waits for in-flight handlers.
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.alarms {
            if let Err(e) = handle.await {
                warn!("Alarm {} ended abnormally: {}", name, e);
            }
        }
    }
}
