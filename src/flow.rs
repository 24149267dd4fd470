use std::sync::Arc;

use crate::feature::graph::FeatureGraph;
use crate::feature::nodes::FlowEndReason;
use crate::feature::types::FeatureValue;
use crate::packet::{FlowKey, Packet, FIN_FLAG, RST_FLAG};
use crate::template::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    New,
    Active,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpSide {
    Established,
    FinSent,
    FinAcked,
}

/// Tracks a graceful FIN exchange per direction so a TCP flow can close
/// at the packet completing termination instead of waiting for a
/// timeout. An RST terminates immediately.
#[derive(Debug, Clone)]
struct TcpTermination {
    state_fwd: TcpSide,
    state_bwd: TcpSide,
    expected_ack_fwd: Option<u32>,
    expected_ack_bwd: Option<u32>,
}

impl TcpTermination {
    fn new() -> Self {
        TcpTermination {
            state_fwd: TcpSide::Established,
            state_bwd: TcpSide::Established,
            expected_ack_fwd: None,
            expected_ack_bwd: None,
        }
    }

    fn observe(&mut self, packet: &Packet, forward: bool) -> bool {
        if packet.has_flag(RST_FLAG) {
            return true;
        }
        if packet.has_flag(FIN_FLAG) {
            if forward {
                self.state_fwd = TcpSide::FinSent;
                self.expected_ack_bwd = Some(
                    packet
                        .sequence_number
                        .wrapping_add(packet.payload_length as u32)
                        .wrapping_add(1),
                );
            } else {
                self.state_bwd = TcpSide::FinSent;
                self.expected_ack_fwd = Some(
                    packet
                        .sequence_number
                        .wrapping_add(packet.payload_length as u32)
                        .wrapping_add(1),
                );
            }
        }

        if self.state_bwd == TcpSide::FinSent
            && forward
            && Some(packet.ack_number) == self.expected_ack_fwd
        {
            self.state_bwd = TcpSide::FinAcked;
        } else if self.state_fwd == TcpSide::FinSent
            && !forward
            && Some(packet.ack_number) == self.expected_ack_bwd
        {
            self.state_fwd = TcpSide::FinAcked;
        }

        self.state_fwd == TcpSide::FinAcked && self.state_bwd == TcpSide::FinAcked
    }
}

/// One live flow: the canonical key, its timers, counters and the owned
/// feature graph instance. Owned and mutated by exactly one shard.
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    /// Shard-local creation sequence; tie-breaker in the timer indexes.
    pub seq: u64,
    pub start_time: i64,
    pub last_time: i64,
    /// Constant after creation: `start_time + active_timeout`.
    pub active_deadline: i64,
    pub state: FlowState,
    pub packets: u64,
    pub octets: u64,
    graph: FeatureGraph,
    tcp: TcpTermination,
}

impl Flow {
    pub fn new(key: FlowKey, seq: u64, graph: FeatureGraph) -> Self {
        Flow {
            key,
            seq,
            start_time: 0,
            last_time: 0,
            active_deadline: 0,
            state: FlowState::New,
            packets: 0,
            octets: 0,
            graph,
            tcp: TcpTermination::new(),
        }
    }

    /// Arms the timers and resets the graph; called exactly once, at the
    /// first packet.
    pub fn start(&mut self, now: i64, active_timeout_ns: i64) {
        debug_assert_eq!(self.state, FlowState::New);
        self.start_time = now;
        self.last_time = now;
        self.active_deadline = now.saturating_add(active_timeout_ns);
        self.graph.start(now);
        self.state = FlowState::Active;
    }

    pub fn idle_deadline(&self, idle_timeout_ns: i64) -> i64 {
        self.last_time.saturating_add(idle_timeout_ns)
    }

    /// Feeds one packet into the graph and the termination tracker.
    /// Returns true when the flow asks to be stopped (`EndOfFlow`).
    pub fn event(&mut self, packet: &Packet) -> bool {
        debug_assert_eq!(self.state, FlowState::Active);
        self.graph.event(packet, packet.timestamp_ns);
        self.last_time = packet.timestamp_ns;
        self.packets += 1;
        self.octets += packet.length as u64;
        packet.protocol == 6 && self.tcp.observe(packet, packet.forward)
    }

    /// Finalizes the graph and yields the record to export. Consumes the
    /// flow; a stopped flow receives no further events.
    pub fn stop(
        mut self,
        reason: FlowEndReason,
        when: i64,
    ) -> (Arc<Template>, Vec<Option<FeatureValue>>) {
        self.state = FlowState::Stopped;
        self.graph.stop(reason, when);
        let template = Arc::clone(self.graph.template());
        (template, self.graph.values())
    }
}
