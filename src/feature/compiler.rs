use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::template::{iana_element, IeType, InformationElement, Template};

use super::graph::FeatureGraph;
use super::nodes::{BinarySlots, Node, NodeState, PacketField};
use super::registry::{flow_arity, variants, FeatureKind};
use super::types::{FeatureValue, Number};

/// Errors surfaced while turning the JSON specification into a graph.
/// All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("invalid feature specification: {0}")]
    Invalid(String),
    #[error("unknown feature {0:?}")]
    Unknown(String),
    #[error("feature {feature:?} cannot be used {context}")]
    Kind {
        feature: String,
        context: &'static str,
    },
    #[error("no overload of {feature:?} matches its arguments")]
    Overload { feature: String },
    #[error("selection {0:?} not found in specification")]
    SelectionNotFound(String),
}

/// Where an expression appears, deciding which feature kinds are
/// acceptable and in which order overloads are preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    /// A top-level exported feature.
    Export,
    /// The data argument of a flow aggregator.
    PacketArg,
    /// An operand of a per-packet match/arithmetic feature.
    MatchArg,
    /// The second argument of `apply`.
    SourceArg,
    /// A position requiring a selection.
    SelectionArg,
    /// An operand of stop-time flow arithmetic.
    FlowArg,
}

impl Ctx {
    fn preference(self) -> &'static [FeatureKind] {
        use FeatureKind::*;
        match self {
            Ctx::Export => &[Flow, Packet, Match, Const],
            Ctx::PacketArg => &[Packet, Match],
            Ctx::MatchArg => &[Packet, Match, Const],
            Ctx::SourceArg => &[Selection, Packet, Match],
            Ctx::SelectionArg => &[Selection],
            Ctx::FlowArg => &[Flow, Const],
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Ctx::Export => "as an exported feature",
            Ctx::PacketArg => "as the input of a flow aggregator",
            Ctx::MatchArg => "as a per-packet operand",
            Ctx::SourceArg => "as the source argument of apply",
            Ctx::SelectionArg => "where a selection is required",
            Ctx::FlowArg => "as a stop-time operand",
        }
    }

    fn accepts(self, kind: FeatureKind) -> bool {
        self.preference().contains(&kind)
    }
}

/// Canonical spelling of an expression; used for node deduplication,
/// template names of composite features and error messages.
fn spell(expr: &Value) -> String {
    match expr {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(map) => match map.iter().next() {
            Some((name, Value::Array(args))) => {
                let mut out = String::from(name.as_str());
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&spell(arg));
                }
                out.push(')');
                out
            }
            _ => format!("{expr}"),
        },
        other => format!("{other}"),
    }
}

fn const_of(expr: &Value) -> Option<FeatureValue> {
    match expr {
        Value::Bool(b) => Some(FeatureValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(FeatureValue::Signed(v))
            } else if let Some(v) = n.as_u64() {
                Some(FeatureValue::Unsigned(v))
            } else {
                n.as_f64().map(FeatureValue::Float)
            }
        }
        _ => None,
    }
}

fn call_of(expr: &Value) -> Option<(&str, &[Value])> {
    let Value::Object(map) = expr else { return None };
    let mut entries = map.iter();
    let (name, args) = entries.next()?;
    if entries.next().is_some() {
        return None;
    }
    let Value::Array(args) = args else { return None };
    Some((name.as_str(), args.as_slice()))
}

/// A compiled feature list: the shared template plus a prototype graph
/// cloned once per flow.
#[derive(Debug, Clone)]
pub struct CompiledSpec {
    prototype: FeatureGraph,
}

impl CompiledSpec {
    pub fn compile(features: &Value) -> Result<Self, SpecError> {
        let Value::Array(list) = features else {
            return Err(SpecError::Invalid(
                "feature specification must be an array".into(),
            ));
        };
        let mut compiler = Compiler::default();
        for expr in list {
            let (idx, kind) = compiler.build(expr, Ctx::Export)?;
            if kind == FeatureKind::Selection {
                return Err(SpecError::Kind {
                    feature: spell(expr),
                    context: Ctx::Export.describe(),
                });
            }
            let element = compiler.export_element(idx, &spell(expr));
            compiler.exports.push(idx);
            compiler.elements.push(element);
        }
        compiler.finish()
    }

    pub fn template(&self) -> Arc<Template> {
        Arc::clone(&self.prototype.template)
    }

    /// A fresh, zero-initialized graph for one flow.
    pub fn instantiate(&self) -> FeatureGraph {
        self.prototype.clone()
    }
}

#[derive(Default)]
struct Compiler {
    nodes: Vec<Node>,
    flow_source: Vec<bool>,
    dedup: HashMap<String, usize>,
    exports: Vec<usize>,
    elements: Vec<InformationElement>,
}

impl Compiler {
    fn finish(self) -> Result<CompiledSpec, SpecError> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.args.iter().any(|&arg| arg >= idx) {
                return Err(SpecError::Invalid("cyclic feature graph".into()));
            }
        }
        let flow_sources = (0..self.nodes.len())
            .filter(|&idx| self.flow_source[idx])
            .collect();
        Ok(CompiledSpec {
            prototype: FeatureGraph {
                nodes: self.nodes,
                flow_sources,
                exports: self.exports,
                template: Template::new(0, self.elements),
            },
        })
    }

    fn push(&mut self, key: String, node: Node, flow_source: bool) -> usize {
        if let Some(&idx) = self.dedup.get(&key) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.flow_source.push(flow_source);
        self.dedup.insert(key, idx);
        idx
    }

    fn subscribe(&mut self, producer: usize, consumer: usize) {
        if !self.nodes[producer].is_constant()
            && !self.nodes[producer].dependents.contains(&consumer)
        {
            self.nodes[producer].dependents.push(consumer);
        }
    }

    fn push_const(&mut self, value: FeatureValue, spelling: &str) -> usize {
        let mut node = Node::new(NodeState::Const, Vec::new());
        node.value = Some(value);
        self.push(format!("const|{spelling}"), node, false)
    }

    /// Builds the node for `expr` in context `ctx`, returning its index
    /// and resolved kind. Shared subexpressions resolve to one node.
    fn build(&mut self, expr: &Value, ctx: Ctx) -> Result<(usize, FeatureKind), SpecError> {
        if let Some(value) = const_of(expr) {
            if !ctx.accepts(FeatureKind::Const) {
                return Err(SpecError::Kind {
                    feature: spell(expr),
                    context: ctx.describe(),
                });
            }
            let idx = self.push_const(value, &spell(expr));
            return Ok((idx, FeatureKind::Const));
        }

        match expr {
            Value::String(name) => self.build_name(name, ctx),
            Value::Object(_) => {
                let (name, args) = call_of(expr).ok_or_else(|| {
                    SpecError::Invalid(format!(
                        "feature call must be a single-key object: {}",
                        spell(expr)
                    ))
                })?;
                self.build_call(name, args, expr, ctx)
            }
            other => Err(SpecError::Invalid(format!(
                "unsupported feature expression: {other}"
            ))),
        }
    }

    /// A bare name: a raw packet field or a zero-argument flow feature,
    /// chosen by the context's preference order.
    fn build_name(&mut self, name: &str, ctx: Ctx) -> Result<(usize, FeatureKind), SpecError> {
        let overloads = variants(name);
        if overloads.is_empty() {
            return Err(SpecError::Unknown(name.to_string()));
        }
        for &kind in ctx.preference() {
            let fits = overloads
                .iter()
                .any(|variant| variant.kind == kind && variant.args.is_empty());
            if !fits {
                continue;
            }
            match kind {
                FeatureKind::Packet => {
                    let field = PacketField::from_name(name).ok_or_else(|| {
                        SpecError::Unknown(name.to_string())
                    })?;
                    let idx = self.push(
                        format!("pkt|{name}"),
                        Node::new(NodeState::PacketField(field), Vec::new()),
                        true,
                    );
                    return Ok((idx, FeatureKind::Packet));
                }
                FeatureKind::Flow => {
                    let idx = self.build_flow_zero(name)?;
                    return Ok((idx, FeatureKind::Flow));
                }
                _ => continue,
            }
        }
        Err(SpecError::Kind {
            feature: name.to_string(),
            context: ctx.describe(),
        })
    }

    /// Zero-argument flow features. `octetTotalCount` expands to a sum
    /// over the per-packet field of the same name.
    fn build_flow_zero(&mut self, name: &str) -> Result<usize, SpecError> {
        let key = format!("flow|{name}");
        if let Some(&idx) = self.dedup.get(&key) {
            return Ok(idx);
        }
        let idx = match name {
            "count" | "packetTotalCount" => {
                self.push(key, Node::new(NodeState::Count { n: 0 }, Vec::new()), true)
            }
            "octetTotalCount" => {
                let field = self.push(
                    "pkt|octetTotalCount".to_string(),
                    Node::new(
                        NodeState::PacketField(PacketField::OctetTotalCount),
                        Vec::new(),
                    ),
                    true,
                );
                let sum = self.push(
                    key,
                    Node::new(NodeState::Sum { total: None }, vec![field]),
                    false,
                );
                self.subscribe(field, sum);
                sum
            }
            "flowStartNanoseconds" => self.push(
                key,
                Node::new(NodeState::FlowStart { t: None }, Vec::new()),
                false,
            ),
            "flowEndNanoseconds" => {
                self.push(key, Node::new(NodeState::FlowEnd, Vec::new()), false)
            }
            "flowEndReason" => self.push(
                key,
                Node::new(NodeState::FlowEndReasonField, Vec::new()),
                false,
            ),
            _ => {
                return Err(SpecError::Overload {
                    feature: name.to_string(),
                })
            }
        };
        Ok(idx)
    }

    fn build_call(
        &mut self,
        name: &str,
        args: &[Value],
        expr: &Value,
        ctx: Ctx,
    ) -> Result<(usize, FeatureKind), SpecError> {
        let spelling = spell(expr);
        match name {
            "apply" => self.build_apply(args, &spelling, ctx),
            "map" => self.build_map(args, &spelling, ctx),
            "select" => {
                if !ctx.accepts(FeatureKind::Selection) {
                    return Err(SpecError::Kind {
                        feature: spelling,
                        context: ctx.describe(),
                    });
                }
                let [matcher] = args else {
                    return Err(SpecError::Overload { feature: spelling });
                };
                let (matcher, _) = self.build(matcher, Ctx::MatchArg)?;
                let idx = self.push(
                    spelling,
                    Node::new(NodeState::Select { gate: false }, vec![matcher]),
                    true,
                );
                self.subscribe(matcher, idx);
                Ok((idx, FeatureKind::Selection))
            }
            "select_slice" => self.build_select_slice(args, &spelling, ctx),
            "mean" | "min" | "max" | "sum" | "accumulate" | "concatenate" => {
                if !ctx.accepts(FeatureKind::Flow) {
                    return Err(SpecError::Kind {
                        feature: spelling,
                        context: ctx.describe(),
                    });
                }
                let [input] = args else {
                    return Err(SpecError::Overload { feature: spelling });
                };
                let (input, _) = self.build(input, Ctx::PacketArg)?;
                let idx = self.push(
                    spelling,
                    Node::new(aggregator_state(name), vec![input]),
                    false,
                );
                self.subscribe(input, idx);
                Ok((idx, FeatureKind::Flow))
            }
            "count" | "packetTotalCount" if args.is_empty() => {
                if !ctx.accepts(FeatureKind::Flow) {
                    return Err(SpecError::Kind {
                        feature: spelling,
                        context: ctx.describe(),
                    });
                }
                Ok((self.build_flow_zero(name)?, FeatureKind::Flow))
            }
            "less" | "geq" => {
                if !ctx.accepts(FeatureKind::Match) {
                    return Err(SpecError::Kind {
                        feature: spelling,
                        context: ctx.describe(),
                    });
                }
                self.build_match_binary(name, args, &spelling)
            }
            "divide" | "multiply" | "log" => self.build_arith(name, args, &spelling, ctx),
            "count" | "packetTotalCount" => Err(SpecError::Overload { feature: spelling }),
            _ => Err(SpecError::Unknown(name.to_string())),
        }
    }

    /// `apply(f, src)`: instantiate the flow feature `f` with `src` as
    /// its event source (zero-argument aggregators) or its data argument.
    fn build_apply(
        &mut self,
        args: &[Value],
        spelling: &str,
        ctx: Ctx,
    ) -> Result<(usize, FeatureKind), SpecError> {
        if !ctx.accepts(FeatureKind::Flow) {
            return Err(SpecError::Kind {
                feature: spelling.to_string(),
                context: ctx.describe(),
            });
        }
        let [function, source] = args else {
            return Err(SpecError::Overload {
                feature: spelling.to_string(),
            });
        };
        let Value::String(function) = function else {
            return Err(SpecError::Kind {
                feature: spell(function),
                context: "as the function argument of apply",
            });
        };
        let arity = flow_arity(function).ok_or_else(|| SpecError::Kind {
            feature: function.clone(),
            context: "as the function argument of apply",
        })?;
        match arity {
            0 => {
                let (src, _) = self.build(source, Ctx::SourceArg)?;
                let state = match function.as_str() {
                    "count" | "packetTotalCount" => NodeState::Count { n: 0 },
                    other => {
                        return Err(SpecError::Kind {
                            feature: other.to_string(),
                            context: "as the function argument of apply",
                        })
                    }
                };
                let idx = self.push(spelling.to_string(), Node::new(state, Vec::new()), false);
                self.subscribe(src, idx);
                Ok((idx, FeatureKind::Flow))
            }
            1 => {
                let (src, _) = self.build(source, Ctx::PacketArg)?;
                let idx = self.push(
                    spelling.to_string(),
                    Node::new(aggregator_state(function), vec![src]),
                    false,
                );
                self.subscribe(src, idx);
                Ok((idx, FeatureKind::Flow))
            }
            _ => Err(SpecError::Overload {
                feature: spelling.to_string(),
            }),
        }
    }

    /// `map(field, selection)`: a raw packet field fed only with the
    /// packets the selection forwards.
    fn build_map(
        &mut self,
        args: &[Value],
        spelling: &str,
        ctx: Ctx,
    ) -> Result<(usize, FeatureKind), SpecError> {
        if !ctx.accepts(FeatureKind::Packet) {
            return Err(SpecError::Kind {
                feature: spelling.to_string(),
                context: ctx.describe(),
            });
        }
        let [field, selection] = args else {
            return Err(SpecError::Overload {
                feature: spelling.to_string(),
            });
        };
        let field = field
            .as_str()
            .and_then(PacketField::from_name)
            .ok_or_else(|| SpecError::Kind {
                feature: spell(field),
                context: "as the field argument of map",
            })?;
        let (selection, _) = self.build(selection, Ctx::SelectionArg)?;
        let idx = self.push(
            spelling.to_string(),
            Node::new(NodeState::PacketField(field), Vec::new()),
            false,
        );
        self.subscribe(selection, idx);
        Ok((idx, FeatureKind::Packet))
    }

    fn build_select_slice(
        &mut self,
        args: &[Value],
        spelling: &str,
        ctx: Ctx,
    ) -> Result<(usize, FeatureKind), SpecError> {
        if !ctx.accepts(FeatureKind::Selection) {
            return Err(SpecError::Kind {
                feature: spelling.to_string(),
                context: ctx.describe(),
            });
        }
        if args.len() != 2 && args.len() != 3 {
            return Err(SpecError::Overload {
                feature: spelling.to_string(),
            });
        }
        let bound = |value: &Value| -> Result<u64, SpecError> {
            const_of(value)
                .and_then(|v| v.as_number())
                .map(Number::to_i64)
                .filter(|&v| v >= 0)
                .map(|v| v as u64)
                .ok_or_else(|| SpecError::Kind {
                    feature: spell(value),
                    context: "as a select_slice bound",
                })
        };
        let from = bound(&args[0])?;
        let to = bound(&args[1])?;
        let source = match args.get(2) {
            Some(selection) => Some(self.build(selection, Ctx::SelectionArg)?.0),
            None => None,
        };
        let idx = self.push(
            spelling.to_string(),
            Node::new(
                NodeState::SelectSlice {
                    from,
                    to,
                    current: 0,
                },
                Vec::new(),
            ),
            source.is_none(),
        );
        if let Some(source) = source {
            self.subscribe(source, idx);
        }
        Ok((idx, FeatureKind::Selection))
    }

    fn build_match_binary(
        &mut self,
        name: &str,
        args: &[Value],
        spelling: &str,
    ) -> Result<(usize, FeatureKind), SpecError> {
        let [left, right] = args else {
            return Err(SpecError::Overload {
                feature: spelling.to_string(),
            });
        };
        let (left, _) = self.build(left, Ctx::MatchArg)?;
        let (right, _) = self.build(right, Ctx::MatchArg)?;

        if let (Some(a), Some(b)) = (self.const_number(left), self.const_number(right)) {
            let value = match name {
                "less" => FeatureValue::Bool(a.less(b)),
                _ => FeatureValue::Bool(a.geq(b)),
            };
            return Ok((self.push_const(value, spelling), FeatureKind::Const));
        }

        let init = [self.const_number(left), self.const_number(right)];
        let slots = BinarySlots::with_consts(init);
        let state = match name {
            "less" => NodeState::Less { slots },
            _ => NodeState::Geq { slots },
        };
        let idx = self.push(spelling.to_string(), Node::new(state, vec![left, right]), false);
        self.subscribe(left, idx);
        self.subscribe(right, idx);
        Ok((idx, FeatureKind::Match))
    }

    /// Arithmetic resolves to the per-packet form or the stop-time form,
    /// tried in the context's preference order.
    fn build_arith(
        &mut self,
        name: &str,
        args: &[Value],
        spelling: &str,
        ctx: Ctx,
    ) -> Result<(usize, FeatureKind), SpecError> {
        let wanted_arity = if name == "log" { 1 } else { 2 };
        if args.len() != wanted_arity {
            return Err(SpecError::Overload {
                feature: spelling.to_string(),
            });
        }
        for &kind in ctx.preference() {
            match kind {
                FeatureKind::Match
                    if args.iter().all(|a| self.admits(a, Ctx::MatchArg)) =>
                {
                    return self.build_arith_match(name, args, spelling);
                }
                FeatureKind::Flow
                    if args.iter().all(|a| self.admits(a, Ctx::FlowArg)) =>
                {
                    return self.build_arith_flow(name, args, spelling);
                }
                _ => continue,
            }
        }
        Err(SpecError::Overload {
            feature: spelling.to_string(),
        })
    }

    fn build_arith_match(
        &mut self,
        name: &str,
        args: &[Value],
        spelling: &str,
    ) -> Result<(usize, FeatureKind), SpecError> {
        if name == "log" {
            let (input, _) = self.build(&args[0], Ctx::MatchArg)?;
            if let Some(a) = self.const_number(input) {
                let value = FeatureValue::Float(a.to_f64().ln());
                return Ok((self.push_const(value, spelling), FeatureKind::Const));
            }
            let idx = self.push(
                spelling.to_string(),
                Node::new(NodeState::Log, vec![input]),
                false,
            );
            self.subscribe(input, idx);
            return Ok((idx, FeatureKind::Match));
        }

        let (left, _) = self.build(&args[0], Ctx::MatchArg)?;
        let (right, _) = self.build(&args[1], Ctx::MatchArg)?;
        if let (Some(a), Some(b)) = (self.const_number(left), self.const_number(right)) {
            let value = match name {
                "multiply" => Some(a.mul(b)),
                _ => a.div(b),
            };
            let value = value.ok_or_else(|| {
                SpecError::Invalid(format!("constant division by zero in {spelling}"))
            })?;
            return Ok((self.push_const(value.into(), spelling), FeatureKind::Const));
        }
        let init = [self.const_number(left), self.const_number(right)];
        let slots = BinarySlots::with_consts(init);
        let state = match name {
            "multiply" => NodeState::Multiply { slots },
            _ => NodeState::Divide { slots },
        };
        let idx = self.push(spelling.to_string(), Node::new(state, vec![left, right]), false);
        self.subscribe(left, idx);
        self.subscribe(right, idx);
        Ok((idx, FeatureKind::Match))
    }

    fn build_arith_flow(
        &mut self,
        name: &str,
        args: &[Value],
        spelling: &str,
    ) -> Result<(usize, FeatureKind), SpecError> {
        let mut built = Vec::with_capacity(args.len());
        for arg in args {
            built.push(self.build(arg, Ctx::FlowArg)?.0);
        }
        if built.iter().all(|&idx| self.const_number(idx).is_some()) {
            let a = self.const_number(built[0]).unwrap();
            let value = match name {
                "log" => Some(Number::Float(a.to_f64().ln())),
                "multiply" => Some(a.mul(self.const_number(built[1]).unwrap())),
                _ => a.div(self.const_number(built[1]).unwrap()),
            };
            let value = value.ok_or_else(|| {
                SpecError::Invalid(format!("constant division by zero in {spelling}"))
            })?;
            return Ok((self.push_const(value.into(), spelling), FeatureKind::Const));
        }
        let state = match name {
            "log" => NodeState::LogFlow,
            "multiply" => NodeState::MultiplyFlow,
            _ => NodeState::DivideFlow,
        };
        // stop-time nodes read their arguments directly; no event edges
        let idx = self.push(spelling.to_string(), Node::new(state, built), false);
        Ok((idx, FeatureKind::Flow))
    }

    /// Whether `expr` could be built in `ctx`; pure lookahead used to
    /// pick between arithmetic forms.
    fn admits(&self, expr: &Value, ctx: Ctx) -> bool {
        if const_of(expr).is_some() {
            return ctx.accepts(FeatureKind::Const);
        }
        match expr {
            Value::String(name) => ctx.preference().iter().any(|&kind| {
                variants(name)
                    .iter()
                    .any(|variant| variant.kind == kind && variant.args.is_empty())
            }),
            Value::Object(_) => {
                let Some((name, args)) = call_of(expr) else {
                    return false;
                };
                match name {
                    "apply" => ctx.accepts(FeatureKind::Flow),
                    "map" => ctx.accepts(FeatureKind::Packet),
                    "select" | "select_slice" => ctx.accepts(FeatureKind::Selection),
                    "mean" | "min" | "max" | "sum" | "accumulate" | "concatenate" => {
                        ctx.accepts(FeatureKind::Flow)
                    }
                    "count" | "packetTotalCount" => ctx.accepts(FeatureKind::Flow),
                    "less" | "geq" => ctx.accepts(FeatureKind::Match),
                    "divide" | "multiply" | "log" => {
                        (ctx.accepts(FeatureKind::Match)
                            && args.iter().all(|a| self.admits(a, Ctx::MatchArg)))
                            || (ctx.accepts(FeatureKind::Flow)
                                && args.iter().all(|a| self.admits(a, Ctx::FlowArg)))
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn const_number(&self, idx: usize) -> Option<Number> {
        let node = &self.nodes[idx];
        if node.is_constant() {
            node.value.as_ref().and_then(FeatureValue::as_number)
        } else {
            None
        }
    }

    /// The Information Element describing one exported node: an IANA
    /// element when the spelling matches the registry, a temporary one
    /// (id 0) otherwise.
    fn export_element(&self, idx: usize, spelling: &str) -> InformationElement {
        iana_element(spelling)
            .unwrap_or_else(|| InformationElement::temporary(spelling, self.ie_type_of(idx)))
    }

    fn ie_type_of(&self, idx: usize) -> IeType {
        match &self.nodes[idx].state {
            NodeState::Const => match self.nodes[idx].value {
                Some(FeatureValue::Bool(_)) => IeType::Boolean,
                Some(FeatureValue::Signed(_)) => IeType::Signed64,
                Some(FeatureValue::Float(_)) => IeType::Float64,
                _ => IeType::Unsigned64,
            },
            NodeState::PacketField(field) => field.ie_type(),
            NodeState::Count { .. } => IeType::Unsigned64,
            NodeState::Mean { .. } => IeType::Float64,
            NodeState::Sum { .. } | NodeState::Min | NodeState::Max => {
                self.arg_type(idx, 0)
            }
            NodeState::Accumulate { .. } | NodeState::Concatenate { .. } => IeType::OctetArray,
            NodeState::Select { .. } | NodeState::SelectSlice { .. } => IeType::OctetArray,
            NodeState::Less { .. } | NodeState::Geq { .. } => IeType::Boolean,
            NodeState::Divide { .. }
            | NodeState::Multiply { .. }
            | NodeState::DivideFlow
            | NodeState::MultiplyFlow => {
                combine_numeric(self.arg_type(idx, 0), self.arg_type(idx, 1))
            }
            NodeState::Log | NodeState::LogFlow => IeType::Float64,
            NodeState::FlowStart { .. } | NodeState::FlowEnd => IeType::DateTimeNanoseconds,
            NodeState::FlowEndReasonField => IeType::Unsigned64,
        }
    }

    fn arg_type(&self, idx: usize, pos: usize) -> IeType {
        self.nodes[idx]
            .args
            .get(pos)
            .map(|&arg| self.ie_type_of(arg))
            .unwrap_or(IeType::Unsigned64)
    }
}

fn combine_numeric(a: IeType, b: IeType) -> IeType {
    if a == IeType::Float64 || b == IeType::Float64 {
        IeType::Float64
    } else if a == IeType::Signed64 || b == IeType::Signed64 {
        IeType::Signed64
    } else {
        IeType::Unsigned64
    }
}

fn aggregator_state(name: &str) -> NodeState {
    match name {
        "mean" => NodeState::Mean {
            total: None,
            count: 0,
        },
        "min" => NodeState::Min,
        "max" => NodeState::Max,
        "sum" => NodeState::Sum { total: None },
        "accumulate" => NodeState::Accumulate { items: Vec::new() },
        "concatenate" => NodeState::Concatenate { buffer: Vec::new() },
        other => unreachable!("not a flow aggregator: {other}"),
    }
}

/// Picks one `features` array out of the specification document: the top
/// level maps selection names to arrays of groups, each carrying an
/// integer `id` (or addressed by position) and a `features` list.
pub fn select_features(doc: &Value, key: &str, id: u64) -> Result<Value, SpecError> {
    let groups = doc
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| SpecError::SelectionNotFound(format!("{key}:{id}")))?;
    for (position, group) in groups.iter().enumerate() {
        let matches = match group.get("id").and_then(Value::as_u64) {
            Some(group_id) => group_id == id,
            None => position as u64 == id,
        };
        if matches {
            return group
                .get("features")
                .cloned()
                .ok_or_else(|| {
                    SpecError::Invalid(format!("selection {key}:{id} has no features list"))
                });
        }
    }
    Err(SpecError::SelectionNotFound(format!("{key}:{id}")))
}
