use std::net::IpAddr;

use log::warn;

use crate::packet::Packet;
use crate::template::IeType;

use super::types::{FeatureValue, Number};

/// Raw packet fields the graph can read. Extraction returns `None` when
/// the field does not apply to the packet (an IPv4 field on an IPv6
/// packet); no event is emitted in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketField {
    SourceIPv4Address,
    DestinationIPv4Address,
    SourceIPv6Address,
    DestinationIPv6Address,
    SourceTransportPort,
    DestinationTransportPort,
    ProtocolIdentifier,
    OctetTotalCount,
    TcpControlBits,
}

impl PacketField {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sourceIPv4Address" => Some(PacketField::SourceIPv4Address),
            "destinationIPv4Address" => Some(PacketField::DestinationIPv4Address),
            "sourceIPv6Address" => Some(PacketField::SourceIPv6Address),
            "destinationIPv6Address" => Some(PacketField::DestinationIPv6Address),
            "sourceTransportPort" => Some(PacketField::SourceTransportPort),
            "destinationTransportPort" => Some(PacketField::DestinationTransportPort),
            "protocolIdentifier" => Some(PacketField::ProtocolIdentifier),
            "octetTotalCount" => Some(PacketField::OctetTotalCount),
            "tcpControlBits" => Some(PacketField::TcpControlBits),
            _ => None,
        }
    }

    pub fn ie_type(self) -> IeType {
        match self {
            PacketField::SourceIPv4Address | PacketField::DestinationIPv4Address => {
                IeType::Ipv4Address
            }
            PacketField::SourceIPv6Address | PacketField::DestinationIPv6Address => {
                IeType::Ipv6Address
            }
            _ => IeType::Unsigned64,
        }
    }

    pub fn extract(self, packet: &Packet) -> Option<FeatureValue> {
        match self {
            PacketField::SourceIPv4Address => match packet.src_addr {
                IpAddr::V4(a) => Some(FeatureValue::Ipv4(a)),
                IpAddr::V6(_) => None,
            },
            PacketField::DestinationIPv4Address => match packet.dst_addr {
                IpAddr::V4(a) => Some(FeatureValue::Ipv4(a)),
                IpAddr::V6(_) => None,
            },
            PacketField::SourceIPv6Address => match packet.src_addr {
                IpAddr::V6(a) => Some(FeatureValue::Ipv6(a)),
                IpAddr::V4(_) => None,
            },
            PacketField::DestinationIPv6Address => match packet.dst_addr {
                IpAddr::V6(a) => Some(FeatureValue::Ipv6(a)),
                IpAddr::V4(_) => None,
            },
            PacketField::SourceTransportPort => {
                Some(FeatureValue::Unsigned(packet.src_port as u64))
            }
            PacketField::DestinationTransportPort => {
                Some(FeatureValue::Unsigned(packet.dst_port as u64))
            }
            PacketField::ProtocolIdentifier => {
                Some(FeatureValue::Unsigned(packet.protocol as u64))
            }
            PacketField::OctetTotalCount => Some(FeatureValue::Unsigned(packet.length as u64)),
            PacketField::TcpControlBits => {
                Some(FeatureValue::Unsigned(packet.tcp_flags as u64))
            }
        }
    }
}

/// Why a flow terminated, with the IANA flowEndReason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEndReason {
    IdleTimeout = 1,
    ActiveTimeout = 2,
    EndOfFlow = 3,
}

impl FlowEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowEndReason::IdleTimeout => "IdleTimeout",
            FlowEndReason::ActiveTimeout => "ActiveTimeout",
            FlowEndReason::EndOfFlow => "EndOfFlow",
        }
    }
}

/// One event moving along a graph edge. Control values are `Value`s;
/// packet events carry the packet itself so gated field extraction can
/// happen downstream of a selection.
#[derive(Debug, Clone)]
pub enum Event<'p> {
    Packet(&'p Packet),
    Value(FeatureValue),
}

/// Where an event came from: the flow itself or an upstream node.
/// Selection nodes use this to tell their gate argument apart from the
/// packet stream; forwarded packet events keep the flow origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Flow,
    Node(usize),
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Less,
    Geq,
    Divide,
    Multiply,
}

/// Operand slots of a binary node. Constant arguments are folded into
/// `init` at compile time and restored after every firing, so a node like
/// `geq(octetTotalCount, 100)` fires on each upstream event.
#[derive(Debug, Clone, Default)]
pub struct BinarySlots {
    current: [Option<Number>; 2],
    init: [Option<Number>; 2],
}

impl BinarySlots {
    pub fn with_consts(init: [Option<Number>; 2]) -> Self {
        BinarySlots {
            current: init,
            init,
        }
    }

    fn reset(&mut self) {
        self.current = self.init;
    }
}

/// Per-node state. The set of node kinds is closed, so the event surface
/// is a match on this enum rather than virtual dispatch.
#[derive(Debug, Clone)]
pub enum NodeState {
    Const,
    PacketField(PacketField),
    Count { n: u64 },
    Mean { total: Option<Number>, count: u64 },
    Sum { total: Option<Number> },
    Min,
    Max,
    Accumulate { items: Vec<FeatureValue> },
    Concatenate { buffer: Vec<u8> },
    Select { gate: bool },
    SelectSlice { from: u64, to: u64, current: u64 },
    Less { slots: BinarySlots },
    Geq { slots: BinarySlots },
    Divide { slots: BinarySlots },
    Multiply { slots: BinarySlots },
    Log,
    /// Arithmetic over finished flow features, evaluated at stop time.
    DivideFlow,
    MultiplyFlow,
    LogFlow,
    FlowStart { t: Option<i64> },
    FlowEnd,
    FlowEndReasonField,
}

/// One node instance inside a flow's graph. Edges are indices into the
/// owning graph's node vector; argument indices are always smaller than
/// the node's own index.
#[derive(Debug, Clone)]
pub struct Node {
    pub state: NodeState,
    pub args: Vec<usize>,
    pub dependents: Vec<usize>,
    pub value: Option<FeatureValue>,
    pub failed: bool,
}

impl Node {
    pub fn new(state: NodeState, args: Vec<usize>) -> Self {
        Node {
            state,
            args,
            dependents: Vec::new(),
            value: None,
            failed: false,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.state, NodeState::Const)
    }

    /// Resets per-flow state. Constants keep their folded value.
    pub fn start(&mut self, when: i64) {
        self.failed = false;
        if !self.is_constant() {
            self.value = None;
        }
        match &mut self.state {
            NodeState::Count { n } => *n = 0,
            NodeState::Mean { total, count } => {
                *total = None;
                *count = 0;
            }
            NodeState::Sum { total } => *total = None,
            NodeState::Accumulate { items } => items.clear(),
            NodeState::Concatenate { buffer } => buffer.clear(),
            NodeState::Select { gate } => *gate = false,
            NodeState::SelectSlice { current, .. } => *current = 0,
            NodeState::Less { slots }
            | NodeState::Geq { slots }
            | NodeState::Divide { slots }
            | NodeState::Multiply { slots } => slots.reset(),
            NodeState::FlowStart { t } => *t = Some(when),
            _ => {}
        }
    }

    /// Consumes one event at time `when`; returns the event to broadcast
    /// to dependents, if any.
    pub fn event<'p>(
        &mut self,
        ev: &Event<'p>,
        origin: Origin,
        _when: i64,
    ) -> Option<Event<'p>> {
        let binary = match self.state {
            NodeState::Less { .. } => Some(BinaryOp::Less),
            NodeState::Geq { .. } => Some(BinaryOp::Geq),
            NodeState::Divide { .. } => Some(BinaryOp::Divide),
            NodeState::Multiply { .. } => Some(BinaryOp::Multiply),
            _ => None,
        };
        if let Some(op) = binary {
            return self.binary_event(op, ev, origin);
        }

        match &mut self.state {
            NodeState::Const
            | NodeState::FlowStart { .. }
            | NodeState::FlowEnd
            | NodeState::FlowEndReasonField => None,

            NodeState::PacketField(field) => {
                let field = *field;
                let Event::Packet(packet) = ev else { return None };
                let value = field.extract(packet)?;
                // the retained value is the first one observed; for
                // per-flow-constant fields this equals the initiator view
                if self.value.is_none() {
                    self.value = Some(value.clone());
                }
                Some(Event::Value(value))
            }

            NodeState::Count { n } => {
                *n += 1;
                None
            }

            NodeState::Mean { total, count } => match number_of(ev) {
                Ok(num) => {
                    *total = Some(match *total {
                        Some(t) => t.add(num),
                        None => num,
                    });
                    *count += 1;
                    None
                }
                Err(what) => {
                    mark_failed(&mut self.failed, &mut self.value, what);
                    None
                }
            },

            NodeState::Sum { total } => match number_of(ev) {
                Ok(num) => {
                    *total = Some(match *total {
                        Some(t) => t.add(num),
                        None => num,
                    });
                    None
                }
                Err(what) => {
                    mark_failed(&mut self.failed, &mut self.value, what);
                    None
                }
            },

            NodeState::Min => match number_of(ev) {
                Ok(num) => {
                    let better = match self.value.as_ref().and_then(FeatureValue::as_number) {
                        Some(current) => num.less(current),
                        None => true,
                    };
                    if better {
                        self.value = Some(num.into());
                    }
                    None
                }
                Err(what) => {
                    mark_failed(&mut self.failed, &mut self.value, what);
                    None
                }
            },

            NodeState::Max => match number_of(ev) {
                Ok(num) => {
                    let better = match self.value.as_ref().and_then(FeatureValue::as_number) {
                        Some(current) => current.less(num),
                        None => true,
                    };
                    if better {
                        self.value = Some(num.into());
                    }
                    None
                }
                Err(what) => {
                    mark_failed(&mut self.failed, &mut self.value, what);
                    None
                }
            },

            NodeState::Accumulate { items } => {
                if let Event::Value(v) = ev {
                    items.push(v.clone());
                }
                None
            }

            NodeState::Concatenate { buffer } => {
                if let Event::Value(v) = ev {
                    v.write_canonical(buffer);
                }
                None
            }

            NodeState::Select { gate } => match ev {
                // the gate argument always fires before the flow event
                Event::Value(FeatureValue::Bool(b)) if origin != Origin::Flow => {
                    *gate = *b;
                    None
                }
                Event::Packet(_) => {
                    if *gate {
                        *gate = false;
                        Some(ev.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            },

            NodeState::SelectSlice { from, to, current } => match ev {
                Event::Packet(_) => {
                    let pass = *current >= *from && *current < *to;
                    *current += 1;
                    if pass {
                        Some(ev.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            },

            NodeState::Log => match number_of(ev) {
                Ok(num) => {
                    let out = FeatureValue::Float(num.to_f64().ln());
                    self.value = Some(out.clone());
                    Some(Event::Value(out))
                }
                Err(what) => {
                    mark_failed(&mut self.failed, &mut self.value, what);
                    None
                }
            },

            // evaluated from argument values at stop time
            NodeState::DivideFlow | NodeState::MultiplyFlow | NodeState::LogFlow => None,

            NodeState::Less { .. }
            | NodeState::Geq { .. }
            | NodeState::Divide { .. }
            | NodeState::Multiply { .. } => unreachable!("handled via binary_event"),
        }
    }

    /// Folds one operand into the slot of the argument it came from and
    /// fires once both operands are present. Constant slots are prefilled
    /// by the graph at start and refilled after every firing.
    fn binary_event<'p>(
        &mut self,
        op: BinaryOp,
        ev: &Event<'p>,
        origin: Origin,
    ) -> Option<Event<'p>> {
        let num = match number_of(ev) {
            Ok(num) => num,
            Err(what) => {
                mark_failed(&mut self.failed, &mut self.value, what);
                return None;
            }
        };
        let from = match origin {
            Origin::Node(idx) => idx,
            Origin::Flow => return None,
        };
        let args = &self.args;
        let slots = match &mut self.state {
            NodeState::Less { slots }
            | NodeState::Geq { slots }
            | NodeState::Divide { slots }
            | NodeState::Multiply { slots } => slots,
            _ => return None,
        };
        // one broadcast event fills every slot wired to the producer
        // (duplicate arguments receive a single event per packet)
        let mut matched = false;
        for i in 0..args.len() {
            if args[i] == from {
                matched = true;
                if slots.current[i].is_none() {
                    slots.current[i] = Some(num);
                }
            }
        }
        if !matched {
            return None;
        }

        let (Some(a), Some(b)) = (slots.current[0], slots.current[1]) else {
            return None;
        };
        slots.reset();

        let result = match op {
            BinaryOp::Less => Some(FeatureValue::Bool(a.less(b))),
            BinaryOp::Geq => Some(FeatureValue::Bool(a.geq(b))),
            BinaryOp::Multiply => Some(a.mul(b).into()),
            BinaryOp::Divide => a.div(b).map(Into::into),
        };
        match result {
            Some(out) => {
                self.value = Some(out.clone());
                Some(Event::Value(out))
            }
            None => {
                mark_failed(&mut self.failed, &mut self.value, "division by zero");
                None
            }
        }
    }
}

fn number_of(ev: &Event) -> Result<Number, &'static str> {
    match ev {
        Event::Value(v) => v.as_number().ok_or("expected a numeric value"),
        Event::Packet(_) => Err("expected a value, got a raw packet event"),
    }
}

/// Marks a node failed; its output becomes null. Logged once per flow
/// per node.
pub(super) fn mark_failed(failed: &mut bool, value: &mut Option<FeatureValue>, what: &str) {
    if !*failed {
        warn!("feature evaluation failed: {what}; emitting null");
        *failed = true;
    }
    *value = None;
}
