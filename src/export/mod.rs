pub mod csv;
pub mod ipfix;
pub mod msgpack;
pub mod text;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc::Receiver;

use crate::feature::types::FeatureValue;
use crate::template::Template;

/// One finished flow, ready to leave the process.
#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub template: Arc<Template>,
    /// Ordered to match the template; `None` is a null entry.
    pub values: Vec<Option<FeatureValue>>,
    pub when: i64,
}

/// The narrow contract the core presents records through. Implementations
/// run on the single sink task, so they may block on IO.
pub trait Exporter: Send {
    /// Announces the column names once, before the first record.
    fn fields(&mut self, names: &[String]) -> anyhow::Result<()>;

    fn export(
        &mut self,
        template: &Template,
        values: &[Option<FeatureValue>],
        when: i64,
    ) -> anyhow::Result<()>;

    /// Flush and close. Called exactly once.
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Drains the export queue into the exporter. All shards send into this
/// one queue, which serializes exports without a lock on the hot path.
/// An export failure is fatal: the error propagates and the closed
/// channel stops the shard workers.
pub async fn run_sink(
    mut receiver: Receiver<ExportRecord>,
    mut exporter: Box<dyn Exporter>,
) -> anyhow::Result<()> {
    while let Some(record) = receiver.recv().await {
        exporter.export(&record.template, &record.values, record.when)?;
    }
    exporter.finish()
}

/// `-` means stdout, anything else a file path.
pub fn open_output(path: &str) -> anyhow::Result<Box<dyn Write + Send>> {
    if path == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        let file =
            File::create(path).with_context(|| format!("cannot create output file {path}"))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Canonical textual rendering shared by the text and CSV exporters.
pub fn format_value(value: &Option<FeatureValue>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}
