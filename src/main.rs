mod args;
mod export;
mod feature;
mod flow;
mod flow_table;
mod metrics;
mod packet;
mod parallel;
mod pcap;
mod template;

#[cfg(test)]
mod tests;

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;

use crate::args::{Cli, Format};
use crate::export::csv::CsvExporter;
use crate::export::ipfix::IpfixExporter;
use crate::export::msgpack::MsgpackExporter;
use crate::export::text::TextExporter;
use crate::export::{run_sink, ExportRecord, Exporter};
use crate::feature::compiler::{select_features, CompiledSpec};
use crate::metrics::{EngineMetrics, LogMetrics, MetricsSink};
use crate::parallel::ParallelFlowTable;
use crate::pcap::read_capture_files;

const EXPORT_QUEUE_DEPTH: usize = 1_000;

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("flowfeat: {err:#}");
        std::process::exit(1);
    }
}

fn parse_select(selection: &str) -> anyhow::Result<(&str, u64)> {
    let Some((key, id)) = selection.split_once(':') else {
        bail!("select must be of the form key:id");
    };
    let id = id.parse().context("select must be of the form key:id")?;
    Ok((key, id))
}

fn build_exporter(cli: &Cli) -> anyhow::Result<Box<dyn Exporter>> {
    Ok(match cli.format {
        Format::Text => Box::new(TextExporter::open(&cli.output)?),
        Format::Csv => Box::new(CsvExporter::open(&cli.output)?),
        Format::Msgpack => Box::new(MsgpackExporter::open(&cli.output)?),
        Format::IpfixStream => Box::new(IpfixExporter::connect(
            &cli.output,
            &cli.protocol,
            cli.domain,
            cli.mtu,
            Duration::from_secs(cli.template_interval),
        )?),
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (key, id) = parse_select(&cli.select)?;
    let spec_file = File::open(&cli.features)
        .with_context(|| format!("cannot open feature specification {}", cli.features))?;
    let document: serde_json::Value =
        serde_json::from_reader(spec_file).context("feature specification is not valid JSON")?;
    let features = select_features(&document, key, id)?;
    let spec = Arc::new(CompiledSpec::compile(&features)?);
    let template = spec.template();

    let mut exporter = build_exporter(&cli)?;
    exporter.fields(&template.names())?;

    let metrics = EngineMetrics::new(cli.shards);
    let sink = LogMetrics;
    sink.register(&metrics);
    sink.start_run(&metrics);

    let (export_tx, export_rx) = mpsc::channel::<ExportRecord>(EXPORT_QUEUE_DEPTH);
    let sink_task = tokio::spawn(run_sink(export_rx, exporter));

    let table = ParallelFlowTable::new(
        cli.shards,
        spec,
        cli.active as i64 * 1_000_000_000,
        cli.idle as i64 * 1_000_000_000,
        export_tx,
        &metrics,
    );

    let run_outcome: anyhow::Result<()> = async {
        let final_time =
            read_capture_files(&cli.files, cli.max_packet, &table, &metrics).await?;
        table.eof(final_time).await
    }
    .await;

    // the export queue closes once every shard is done; the sink then
    // finishes the exporter exactly once
    let sink_outcome = sink_task.await.context("exporter task panicked")?;
    run_outcome?;
    sink_outcome?;

    sink.end_run(&metrics);
    Ok(())
}
