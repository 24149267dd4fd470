use std::io::Write;

use crate::feature::types::FeatureValue;
use crate::template::Template;

use super::{format_value, open_output, Exporter};

/// Comma-separated output with a header row; null features become empty
/// cells.
pub struct CsvExporter {
    writer: Box<dyn Write + Send>,
    header_written: bool,
}

impl CsvExporter {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        Ok(CsvExporter {
            writer: open_output(path)?,
            header_written: false,
        })
    }
}

impl Exporter for CsvExporter {
    fn fields(&mut self, names: &[String]) -> anyhow::Result<()> {
        writeln!(self.writer, "{}", names.join(","))?;
        self.header_written = true;
        Ok(())
    }

    fn export(
        &mut self,
        _template: &Template,
        values: &[Option<FeatureValue>],
        _when: i64,
    ) -> anyhow::Result<()> {
        let row: Vec<String> = values.iter().map(format_value).collect();
        writeln!(self.writer, "{}", row.join(","))?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
