use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_secs: u64,
    pub cache: CacheMetrics,
    pub retrieval: RetrievalMetrics,
    pub backfill: BackfillMetrics,
    pub rpc: RpcMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub blocks_saved: u64,
    pub transactions_saved: u64,
    pub save_failures: u64,
    pub dropped_payloads: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalMetrics {
    pub fetched: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillMetrics {
    pub scans: u64,
    pub failed_scans: u64,
    pub transfers_found: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcMetrics {
    pub total_calls: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    blocks_saved: AtomicU64,
    transactions_saved: AtomicU64,
    save_failures: AtomicU64,
    dropped_payloads: AtomicU64,
    retrieval_fetched: AtomicU64,
    retrieval_requeued: AtomicU64,
    backfill_scans: AtomicU64,
    backfill_failures: AtomicU64,
    transfers_found: AtomicU64,
    rpc_calls: AtomicU64,
    rpc_latency_sum_ms: AtomicU64,
    rpc_min_latency_ms: AtomicU64,
    rpc_max_latency_ms: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            blocks_saved: AtomicU64::new(0),
            transactions_saved: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
            dropped_payloads: AtomicU64::new(0),
            retrieval_fetched: AtomicU64::new(0),
            retrieval_requeued: AtomicU64::new(0),
            backfill_scans: AtomicU64::new(0),
            backfill_failures: AtomicU64::new(0),
            transfers_found: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_latency_sum_ms: AtomicU64::new(0),
            rpc_min_latency_ms: AtomicU64::new(u64::MAX),
            rpc_max_latency_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl MetricsCollector {
    pub fn global() -> &'static Self {
        static INSTANCE: std::sync::OnceLock<MetricsCollector> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(MetricsCollector::default)
    }

    pub fn record_block_saved(&self) {
        self.blocks_saved.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_transaction_saved(&self) {
        self.transactions_saved.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_save_failure(&self) {
        self.save_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_dropped_payload(&self) {
        self.dropped_payloads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retrieval(&self, success: bool) {
        if success {
            self.retrieval_fetched.fetch_add(1, Ordering::SeqCst);
        } else {
            self.retrieval_requeued.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_backfill_scan(&self, transfers: Option<usize>) {
        self.backfill_scans.fetch_add(1, Ordering::SeqCst);
        match transfers {
            Some(count) => {
                self.transfers_found
                    .fetch_add(count as u64, Ordering::SeqCst);
            }
            None => {
                self.backfill_failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    pub fn record_rpc_latency(&self, latency: Duration) {
        self.rpc_calls.fetch_add(1, Ordering::SeqCst);
        self.rpc_latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::SeqCst);

        let latency_ms = latency.as_millis() as u64;
        self.rpc_min_latency_ms
            .fetch_min(latency_ms, Ordering::SeqCst);
        self.rpc_max_latency_ms
            .fetch_max(latency_ms, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let rpc_calls = self.rpc_calls.load(Ordering::SeqCst);
        let rpc_latency = self.rpc_latency_sum_ms.load(Ordering::SeqCst);
        let min_rpc = self.rpc_min_latency_ms.load(Ordering::SeqCst);

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            uptime_secs: self.uptime().as_secs(),
            cache: CacheMetrics {
                blocks_saved: self.blocks_saved.load(Ordering::SeqCst),
                transactions_saved: self.transactions_saved.load(Ordering::SeqCst),
                save_failures: self.save_failures.load(Ordering::SeqCst),
                dropped_payloads: self.dropped_payloads.load(Ordering::SeqCst),
            },
            retrieval: RetrievalMetrics {
                fetched: self.retrieval_fetched.load(Ordering::SeqCst),
                requeued: self.retrieval_requeued.load(Ordering::SeqCst),
            },
            backfill: BackfillMetrics {
                scans: self.backfill_scans.load(Ordering::SeqCst),
                failed_scans: self.backfill_failures.load(Ordering::SeqCst),
                transfers_found: self.transfers_found.load(Ordering::SeqCst),
            },
            rpc: RpcMetrics {
                total_calls: rpc_calls,
                avg_latency_ms: if rpc_calls > 0 {
                    rpc_latency as f64 / rpc_calls as f64
                } else {
                    0.0
                },
                min_latency_ms: if min_rpc == u64::MAX { 0 } else { min_rpc },
                max_latency_ms: self.rpc_max_latency_ms.load(Ordering::SeqCst),
            },
        }
    }

    pub fn to_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json();
        tokio::fs::write(path, json).await
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector() {
        let metrics = MetricsCollector::default();

        metrics.record_retrieval(true);
        metrics.record_retrieval(true);
        metrics.record_retrieval(false);
        metrics.record_backfill_scan(Some(4));
        metrics.record_backfill_scan(None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retrieval.fetched, 2);
        assert_eq!(snapshot.retrieval.requeued, 1);
        assert_eq!(snapshot.backfill.scans, 2);
        assert_eq!(snapshot.backfill.failed_scans, 1);
        assert_eq!(snapshot.backfill.transfers_found, 4);
    }

    #[test]
    fn test_rpc_latency_bounds() {
        let metrics = MetricsCollector::default();
        assert_eq!(metrics.snapshot().rpc.min_latency_ms, 0);

        metrics.record_rpc_latency(Duration::from_millis(40));
        metrics.record_rpc_latency(Duration::from_millis(10));

        let rpc = metrics.snapshot().rpc;
        assert_eq!(rpc.total_calls, 2);
        assert_eq!(rpc.min_latency_ms, 10);
        assert_eq!(rpc.max_latency_ms, 40);
        assert!((rpc.avg_latency_ms - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_export() {
        let metrics = MetricsCollector::default();
        metrics.record_block_saved();

        let json = metrics.to_json();
        assert!(json.contains("blocks_saved"));
        assert!(json.contains("retrieval"));
    }
}
