//! Sharded scanner: routes kline updates to single-writer workers.
//!
//! Each worker owns the state of the symbols hashed onto it, which
//! serializes per-symbol processing while distinct symbols proceed in
//! parallel. Workers drain their queues on shutdown so in-flight updates are
//! flushed before the store closes.

use crate::application::processor::{SymbolProcessor, SymbolState};
use crate::domain::market::Candle;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WORKER_QUEUE_CAPACITY: usize = 1024;
const STATS_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Default)]
pub struct ScannerStats {
    pub updates: AtomicU64,
    pub closed_candles: AtomicU64,
}

pub struct ScannerService {
    shards: std::sync::RwLock<Vec<mpsc::Sender<Candle>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    stats_task: JoinHandle<()>,
    stats: Arc<ScannerStats>,
    shard_count: usize,
}

impl ScannerService {
    /// Spawn `shard_count` workers sharing one processor.
    pub fn spawn(processor: Arc<SymbolProcessor>, shard_count: usize) -> Self {
        let stats = Arc::new(ScannerStats::default());
        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel::<Candle>(WORKER_QUEUE_CAPACITY);
            shards.push(tx);
            workers.push(tokio::spawn(Self::run_worker(
                shard,
                rx,
                processor.clone(),
                stats.clone(),
            )));
        }

        let stats_task = tokio::spawn(Self::report_stats(stats.clone()));

        info!("Scanner started with {} worker shards", shard_count);
        Self {
            shards: std::sync::RwLock::new(shards),
            workers: std::sync::Mutex::new(workers),
            stats_task,
            stats,
            shard_count,
        }
    }

    pub fn stats(&self) -> Arc<ScannerStats> {
        self.stats.clone()
    }

    /// Route an update to its symbol's worker. Applies backpressure when the
    /// worker queue is full.
    pub async fn dispatch(&self, candle: Candle) {
        let shard = Self::shard_for(&candle.symbol, self.shard_count);
        let sender = {
            let shards = self.shards.read().expect("shard lock poisoned");
            shards.get(shard).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(candle).await.is_err() {
                    warn!("Scanner worker {} is gone, dropping update", shard);
                }
            }
            None => debug!("Scanner is shutting down, dropping update"),
        }
    }

    fn shard_for(symbol: &str, shard_count: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        (hasher.finish() % shard_count as u64) as usize
    }

    async fn run_worker(
        shard: usize,
        mut rx: mpsc::Receiver<Candle>,
        processor: Arc<SymbolProcessor>,
        stats: Arc<ScannerStats>,
    ) {
        let mut states: HashMap<String, SymbolState> = HashMap::new();
        while let Some(candle) = rx.recv().await {
            stats.updates.fetch_add(1, Ordering::Relaxed);
            if candle.is_closed {
                stats.closed_candles.fetch_add(1, Ordering::Relaxed);
            }
            let state = states.entry(candle.symbol.clone()).or_default();
            processor.handle_update(state, candle).await;
        }
        debug!("Scanner worker {} drained and stopped", shard);
    }

    async fn report_stats(stats: Arc<ScannerStats>) {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(STATS_INTERVAL_SECS));
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            info!(
                updates = stats.updates.load(Ordering::Relaxed),
                closed_candles = stats.closed_candles.load(Ordering::Relaxed),
                "Scanner statistics"
            );
        }
    }

    /// Stop accepting updates, drain worker queues, then stop reporting.
    pub async fn shutdown(&self) {
        self.shards.write().expect("shard lock poisoned").clear();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("worker lock poisoned");
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Scanner worker ended abnormally: {}", e);
            }
        }
        self.stats_task.abort();
        info!("Scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_routing_is_stable_and_in_range() {
        for shard_count in [1usize, 4, 8] {
            for symbol in ["BTCUSDT", "ETHUSDT", "XRPUSDT"] {
                let first = ScannerService::shard_for(symbol, shard_count);
                let second = ScannerService::shard_for(symbol, shard_count);
                assert_eq!(first, second);
                assert!(first < shard_count);
            }
        }
    }
}
