use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::export::{run_sink, ExportRecord, Exporter};
use crate::feature::compiler::CompiledSpec;
use crate::feature::types::FeatureValue;
use crate::metrics::EngineMetrics;
use crate::packet::{FlowKey, Packet};
use crate::parallel::ParallelFlowTable;
use crate::template::Template;

pub const SECOND: i64 = 1_000_000_000;

/// Builds a UDP-ish packet with the canonical key computed the way the
/// decoder computes it.
pub fn packet(
    src: &str,
    src_port: u16,
    dst: &str,
    dst_port: u16,
    protocol: u8,
    timestamp_ns: i64,
    length: u16,
) -> Packet {
    let src_addr: IpAddr = src.parse().unwrap();
    let dst_addr: IpAddr = dst.parse().unwrap();
    let (key, forward) = FlowKey::canonical(protocol, src_addr, src_port, dst_addr, dst_port);
    Packet {
        timestamp_ns,
        key,
        forward,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        protocol,
        length,
        payload_length: length.saturating_sub(40),
        tcp_flags: 0,
        sequence_number: 0,
        ack_number: 0,
    }
}

pub fn tcp_packet(
    src: &str,
    src_port: u16,
    dst: &str,
    dst_port: u16,
    timestamp_ns: i64,
    length: u16,
    flags: u8,
    seq: u32,
    ack: u32,
) -> Packet {
    let mut p = packet(src, src_port, dst, dst_port, 6, timestamp_ns, length);
    p.tcp_flags = flags;
    p.sequence_number = seq;
    p.ack_number = ack;
    p.payload_length = 0;
    p
}

pub fn compile(json: &str) -> CompiledSpec {
    let features: serde_json::Value = serde_json::from_str(json).unwrap();
    CompiledSpec::compile(&features).unwrap()
}

/// Exporter that remembers everything, for asserting on records and on
/// the finish-exactly-once contract.
#[derive(Clone, Default)]
pub struct CollectingExporter {
    pub records: Arc<Mutex<Vec<(Vec<Option<FeatureValue>>, i64)>>>,
    pub fields: Arc<Mutex<Vec<String>>>,
    pub finishes: Arc<AtomicUsize>,
}

impl Exporter for CollectingExporter {
    fn fields(&mut self, names: &[String]) -> anyhow::Result<()> {
        *self.fields.lock().unwrap() = names.to_vec();
        Ok(())
    }

    fn export(
        &mut self,
        _template: &Template,
        values: &[Option<FeatureValue>],
        when: i64,
    ) -> anyhow::Result<()> {
        self.records.lock().unwrap().push((values.to_vec(), when));
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Runs a full table over the given packets and returns the exported
/// records together with the run's metrics and the exporter handle.
pub async fn run_table(
    shards: usize,
    spec_json: &str,
    active_seconds: i64,
    idle_seconds: i64,
    packets: Vec<Packet>,
) -> (
    Vec<(Vec<Option<FeatureValue>>, i64)>,
    Arc<EngineMetrics>,
    CollectingExporter,
) {
    let spec = Arc::new(compile(spec_json));
    let metrics = EngineMetrics::new(shards);
    let collector = CollectingExporter::default();
    let (export_tx, export_rx) = mpsc::channel::<ExportRecord>(1_000);
    let sink = tokio::spawn(run_sink(export_rx, Box::new(collector.clone())));

    let table = ParallelFlowTable::new(
        shards,
        spec,
        active_seconds * SECOND,
        idle_seconds * SECOND,
        export_tx,
        &metrics,
    );
    let final_time = packets.iter().map(|p| p.timestamp_ns).max().unwrap_or(0);
    for p in packets {
        table.dispatch(p).await.unwrap();
    }
    table.eof(final_time).await.unwrap();
    sink.await.unwrap().unwrap();

    let records = collector.records.lock().unwrap().clone();
    (records, metrics, collector)
}
