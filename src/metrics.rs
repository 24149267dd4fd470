use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;

/// Counters maintained at the capture boundary, before sharding.
#[derive(Debug, Default)]
pub struct SourceStats {
    pub packets: AtomicU64,
    pub skipped: AtomicU64,
    pub filtered: AtomicU64,
    pub buffers_allocated: AtomicU64,
    pub buffers_released: AtomicU64,
    pub decode_errors: AtomicU64,
    pub key_errors: AtomicU64,
}

/// Counters maintained by one shard worker. Only the owning worker
/// writes; anyone may read.
#[derive(Debug, Default)]
pub struct ShardStats {
    pub packets: AtomicU64,
    pub flows: AtomicU64,
    pub flow_packets: AtomicU64,
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Point-in-time view of one shard, summable across shards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShardSnapshot {
    pub packets: u64,
    pub flows: u64,
    pub flow_packets: u64,
}

impl std::ops::Add for ShardSnapshot {
    type Output = ShardSnapshot;

    fn add(self, other: ShardSnapshot) -> ShardSnapshot {
        ShardSnapshot {
            packets: self.packets + other.packets,
            flows: self.flows + other.flows,
            flow_packets: self.flow_packets + other.flow_packets,
        }
    }
}

/// The parallel table's public stats shape. Decode and key failures
/// happen before a packet can be hashed to a shard, so per-shard entries
/// carry zeros there and the summed view reports the capture-boundary
/// counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub packets: u64,
    pub flows: u64,
    pub decode_errors: u64,
    pub key_errors: u64,
}

impl std::ops::Add for TableStats {
    type Output = TableStats;

    fn add(self, other: TableStats) -> TableStats {
        TableStats {
            packets: self.packets + other.packets,
            flows: self.flows + other.flows,
            decode_errors: self.decode_errors + other.decode_errors,
            key_errors: self.key_errors + other.key_errors,
        }
    }
}

/// All counters of one engine run: the capture-side stats plus one
/// [`ShardStats`] per shard. Shared read-only with the metrics sink.
#[derive(Debug)]
pub struct EngineMetrics {
    pub source: SourceStats,
    pub shards: Vec<Arc<ShardStats>>,
}

impl EngineMetrics {
    pub fn new(shard_count: usize) -> Arc<Self> {
        Arc::new(EngineMetrics {
            source: SourceStats::default(),
            shards: (0..shard_count)
                .map(|_| Arc::new(ShardStats::default()))
                .collect(),
        })
    }

    pub fn shard(&self, index: usize) -> Arc<ShardStats> {
        Arc::clone(&self.shards[index])
    }

    pub fn snapshot(&self, index: usize) -> ShardSnapshot {
        let shard = &self.shards[index];
        ShardSnapshot {
            packets: read(&shard.packets),
            flows: read(&shard.flows),
            flow_packets: read(&shard.flow_packets),
        }
    }

    pub fn totals(&self) -> ShardSnapshot {
        (0..self.shards.len())
            .map(|index| self.snapshot(index))
            .fold(ShardSnapshot::default(), |acc, s| acc + s)
    }

    /// Per-shard stats in the parallel table's contract shape. Error
    /// counts live at the capture boundary (an undecodable packet never
    /// reaches a shard), so the per-shard entries report them as zero;
    /// use [`EngineMetrics::stats_total`] for the summed view.
    pub fn stats(&self) -> Vec<TableStats> {
        (0..self.shards.len())
            .map(|index| {
                let shard = self.snapshot(index);
                TableStats {
                    packets: shard.packets,
                    flows: shard.flows,
                    decode_errors: 0,
                    key_errors: 0,
                }
            })
            .collect()
    }

    /// All shards summed, with the decode and key error counts folded in
    /// at the level they are counted.
    pub fn stats_total(&self) -> TableStats {
        let mut total = self
            .stats()
            .into_iter()
            .fold(TableStats::default(), |acc, s| acc + s);
        total.decode_errors = read(&self.source.decode_errors);
        total.key_errors = read(&self.source.key_errors);
        total
    }
}

/// Collaborator notified around a run. Publication backends implement
/// this; the default logs the final counters.
pub trait MetricsSink: Send + Sync {
    fn register(&self, metrics: &Arc<EngineMetrics>);
    fn start_run(&self, metrics: &Arc<EngineMetrics>);
    fn end_run(&self, metrics: &Arc<EngineMetrics>);
}

/// Logs one diagnostic line with the run totals.
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn register(&self, _metrics: &Arc<EngineMetrics>) {}

    fn start_run(&self, metrics: &Arc<EngineMetrics>) {
        info!("starting run with {} shards", metrics.shards.len());
    }

    fn end_run(&self, metrics: &Arc<EngineMetrics>) {
        let totals = metrics.stats_total();
        info!(
            "processed {} packets, {} flows ({} skipped, {} decode errors, {} key errors)",
            read(&metrics.source.packets),
            totals.flows,
            read(&metrics.source.skipped),
            totals.decode_errors,
            totals.key_errors,
        );
        log::debug!(
            "{} filtered, {} buffers allocated, {} released",
            read(&metrics.source.filtered),
            read(&metrics.source.buffers_allocated),
            read(&metrics.source.buffers_released),
        );
    }
}
