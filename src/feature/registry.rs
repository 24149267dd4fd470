use super::nodes::PacketField;

/// Kind of a feature as seen by overload resolution. `Const` values come
/// from literals in the specification; `Match` features produce one value
/// per packet without flow state; `Selection` features gate the packet
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Const,
    Packet,
    Flow,
    Selection,
    Match,
}

/// One registered overload of a feature name.
#[derive(Debug, Clone, Copy)]
pub struct Variant {
    pub kind: FeatureKind,
    pub args: &'static [FeatureKind],
}

const fn v(kind: FeatureKind, args: &'static [FeatureKind]) -> Variant {
    Variant { kind, args }
}

use FeatureKind::*;

const PACKET_FIELD: &[Variant] = &[v(Packet, &[])];
// octetTotalCount doubles as a flow feature (total octets of the flow)
const OCTET_TOTAL: &[Variant] = &[v(Packet, &[]), v(Flow, &[])];
const FLOW_ZERO: &[Variant] = &[v(Flow, &[])];
const AGGREGATOR: &[Variant] = &[v(Flow, &[Packet])];
const SELECT: &[Variant] = &[v(Selection, &[Match])];
const SELECT_SLICE: &[Variant] = &[
    v(Selection, &[Const, Const]),
    v(Selection, &[Const, Const, Selection]),
];
const MATCH_BINARY: &[Variant] = &[v(Match, &[Match, Match])];
const ARITH_BINARY: &[Variant] = &[v(Match, &[Match, Match]), v(Flow, &[Flow, Flow])];
const ARITH_UNARY: &[Variant] = &[v(Match, &[Match]), v(Flow, &[Flow])];
const APPLY: &[Variant] = &[v(Flow, &[Flow, Selection])];
const MAP: &[Variant] = &[v(Packet, &[Packet, Selection])];

/// Looks up the overloads registered for a feature name. Empty for
/// unknown names. The table is closed; nothing registers at runtime.
pub fn variants(name: &str) -> &'static [Variant] {
    match name {
        "octetTotalCount" => OCTET_TOTAL,
        "count" | "packetTotalCount" | "flowStartNanoseconds" | "flowEndNanoseconds"
        | "flowEndReason" => FLOW_ZERO,
        "mean" | "min" | "max" | "sum" | "accumulate" | "concatenate" => AGGREGATOR,
        "select" => SELECT,
        "select_slice" => SELECT_SLICE,
        "less" | "geq" => MATCH_BINARY,
        "divide" | "multiply" => ARITH_BINARY,
        "log" => ARITH_UNARY,
        "apply" => APPLY,
        "map" => MAP,
        _ => {
            if PacketField::from_name(name).is_some() {
                PACKET_FIELD
            } else {
                &[]
            }
        }
    }
}

/// The number of data arguments a flow aggregator consumes when used
/// through `apply`; `None` when the name is not a flow feature.
pub fn flow_arity(name: &str) -> Option<usize> {
    variants(name)
        .iter()
        .find(|variant| variant.kind == Flow)
        .map(|variant| variant.args.len())
}
