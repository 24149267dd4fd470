use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use anyhow::Context;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::export::ExportRecord;
use crate::feature::compiler::CompiledSpec;
use crate::flow_table::FlowTable;
use crate::metrics::EngineMetrics;
use crate::packet::{FlowKey, Packet};

const SHARD_QUEUE_DEPTH: usize = 10_000;

/// What travels down a shard queue. Carrying the final timestamp through
/// the queue keeps it ordered behind every packet already enqueued.
enum ShardInput {
    Packet(Packet),
    Eof(i64),
}

/// N single-owner shards behind N bounded queues. The dispatcher hashes
/// each packet's key with a fixed-seed hasher, so a replay of the same
/// capture lands every flow on the same shard.
pub struct ParallelFlowTable {
    senders: Vec<mpsc::Sender<ShardInput>>,
    workers: Vec<JoinHandle<anyhow::Result<()>>>,
}

/// Stable shard assignment: `hash(key) mod n`. `DefaultHasher::new()`
/// uses fixed keys, which makes the assignment reproducible across runs.
pub fn shard_index(key: &FlowKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

impl ParallelFlowTable {
    pub fn new(
        shards: usize,
        spec: Arc<CompiledSpec>,
        active_timeout_ns: i64,
        idle_timeout_ns: i64,
        export: mpsc::Sender<ExportRecord>,
        metrics: &Arc<EngineMetrics>,
    ) -> Self {
        assert!(shards > 0, "need at least one shard");
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<ShardInput>(SHARD_QUEUE_DEPTH);
            let mut table = FlowTable::new(
                Arc::clone(&spec),
                active_timeout_ns,
                idle_timeout_ns,
                metrics.shard(shard),
                export.clone(),
            );
            workers.push(tokio::spawn(async move {
                let mut last_seen = 0i64;
                while let Some(input) = rx.recv().await {
                    match input {
                        ShardInput::Packet(packet) => {
                            last_seen = packet.timestamp_ns;
                            table.process_packet(&packet).await?;
                        }
                        ShardInput::Eof(final_time) => {
                            table.finish(final_time.max(last_seen)).await?;
                            return Ok(());
                        }
                    }
                }
                // input channel dropped without an explicit eof
                table.finish(last_seen).await
            }));
            senders.push(tx);
        }
        debug!("created {shards} flow table shards");
        ParallelFlowTable { senders, workers }
    }

    /// Enqueues a packet on the shard owning its key. Blocks only when
    /// that shard's queue is full (backpressure).
    pub async fn dispatch(&self, packet: Packet) -> anyhow::Result<()> {
        let shard = shard_index(&packet.key, self.senders.len());
        self.senders[shard]
            .send(ShardInput::Packet(packet))
            .await
            .map_err(|_| anyhow::anyhow!("shard {shard} is gone"))
    }

    /// Stops accepting dispatches, drains every shard, stops all
    /// remaining flows at `final_time` and waits for the workers.
    pub async fn eof(self, final_time: i64) -> anyhow::Result<()> {
        for sender in &self.senders {
            // a closed shard already failed; surface that from join below
            let _ = sender.send(ShardInput::Eof(final_time)).await;
        }
        drop(self.senders);
        for worker in self.workers {
            worker.await.context("shard worker panicked")??;
        }
        Ok(())
    }
}
