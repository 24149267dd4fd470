use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use tokio::sync::mpsc;

use crate::export::ExportRecord;
use crate::feature::compiler::CompiledSpec;
use crate::feature::nodes::FlowEndReason;
use crate::flow::Flow;
use crate::metrics::{bump, ShardStats};
use crate::packet::{FlowKey, Packet};

/// One shard of the flow space: a hash map of live flows plus the two
/// timer orderings. Single-threaded; the owning worker is the only
/// writer, and time only advances with packet timestamps, so replays are
/// deterministic.
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    /// Flows in last-touch order; the first entry is the next idle-expiry
    /// candidate. Keyed (last_time, seq) so touches are remove+insert.
    idle_order: BTreeMap<(i64, u64), FlowKey>,
    /// Active deadlines in insertion order. The active timeout is
    /// process-wide and constant, so insertion order is deadline order
    /// and a FIFO replaces a priority queue. Entries for flows that
    /// already ended are skipped on pop.
    active_order: VecDeque<(i64, u64, FlowKey)>,
    spec: Arc<CompiledSpec>,
    active_timeout_ns: i64,
    idle_timeout_ns: i64,
    next_seq: u64,
    stats: Arc<ShardStats>,
    export: mpsc::Sender<ExportRecord>,
}

impl FlowTable {
    pub fn new(
        spec: Arc<CompiledSpec>,
        active_timeout_ns: i64,
        idle_timeout_ns: i64,
        stats: Arc<ShardStats>,
        export: mpsc::Sender<ExportRecord>,
    ) -> Self {
        FlowTable {
            flows: HashMap::new(),
            idle_order: BTreeMap::new(),
            active_order: VecDeque::new(),
            spec,
            active_timeout_ns,
            idle_timeout_ns,
            next_seq: 0,
            stats,
            export,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// The per-packet event loop: advance time, expire deadlines, look up
    /// or create the flow, feed the graph, reorder the idle index.
    pub async fn process_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let now = packet.timestamp_ns;
        self.expire(now).await?;

        bump(&self.stats.packets);

        let old_idle_key = match self.flows.get(&packet.key) {
            Some(flow) => Some((flow.last_time, flow.seq)),
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let mut flow = Flow::new(packet.key, seq, self.spec.instantiate());
                flow.start(now, self.active_timeout_ns);
                self.active_order
                    .push_back((flow.active_deadline, seq, packet.key));
                self.flows.insert(packet.key, flow);
                bump(&self.stats.flows);
                debug!("new flow {}", packet.key);
                None
            }
        };

        let flow = self
            .flows
            .get_mut(&packet.key)
            .ok_or_else(|| anyhow!("flow vanished during processing"))?;
        let terminated = flow.event(packet);
        let seq = flow.seq;
        bump(&self.stats.flow_packets);

        if let Some(old) = old_idle_key {
            self.idle_order.remove(&old);
        }
        self.idle_order.insert((now, seq), packet.key);

        if terminated {
            debug!("flow {} signalled termination", packet.key);
            self.stop_flow(packet.key, FlowEndReason::EndOfFlow, now)
                .await?;
        }
        Ok(())
    }

    /// Emits every flow whose deadline passed. Active timeouts fire
    /// strictly before idle timeouts at the same instant.
    async fn expire(&mut self, now: i64) -> anyhow::Result<()> {
        while let Some(&(deadline, seq, key)) = self.active_order.front() {
            if deadline > now {
                break;
            }
            self.active_order.pop_front();
            let live = self.flows.get(&key).map_or(false, |flow| flow.seq == seq);
            if live {
                self.stop_flow(key, FlowEndReason::ActiveTimeout, now).await?;
            }
        }
        loop {
            let expired = match self.idle_order.iter().next() {
                Some((_, &key))
                    if self
                        .flows
                        .get(&key)
                        .map_or(false, |flow| flow.idle_deadline(self.idle_timeout_ns) <= now) =>
                {
                    Some(key)
                }
                _ => None,
            };
            match expired {
                Some(key) => self.stop_flow(key, FlowEndReason::IdleTimeout, now).await?,
                None => break,
            }
        }
        Ok(())
    }

    /// Stops and emits every remaining flow at `final_time`, in creation
    /// order. Deadlines already passed still fire with their own reason.
    pub async fn finish(&mut self, final_time: i64) -> anyhow::Result<()> {
        self.expire(final_time).await?;
        let mut remaining: Vec<(u64, FlowKey)> = self
            .flows
            .values()
            .map(|flow| (flow.seq, flow.key))
            .collect();
        remaining.sort_unstable_by_key(|entry| entry.0);
        for (_, key) in remaining {
            self.stop_flow(key, FlowEndReason::EndOfFlow, final_time)
                .await?;
        }
        self.active_order.clear();
        debug!("shard drained");
        Ok(())
    }

    /// Shared emission path: remove from all indexes, finalize the graph,
    /// push the record. The flow is gone before the next packet is
    /// processed; a failed push is fatal for the run.
    async fn stop_flow(
        &mut self,
        key: FlowKey,
        reason: FlowEndReason,
        now: i64,
    ) -> anyhow::Result<()> {
        let Some(flow) = self.flows.remove(&key) else {
            return Ok(());
        };
        debug!(
            "stopping flow {} ({}) after {} packets / {} octets",
            key,
            reason.as_str(),
            flow.packets,
            flow.octets
        );
        self.idle_order.remove(&(flow.last_time, flow.seq));
        let (template, values) = flow.stop(reason, now);
        self.export
            .send(ExportRecord {
                template,
                values,
                when: now,
            })
            .await
            .map_err(|_| anyhow!("exporter queue closed"))?;
        Ok(())
    }
}
