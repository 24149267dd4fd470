use std::io::Write;

use crate::feature::types::FeatureValue;
use crate::template::Template;

use super::{open_output, Exporter};

/// Human-readable one-line-per-flow output: `name=value` pairs in
/// template order, `null` for absent features.
pub struct TextExporter {
    writer: Box<dyn Write + Send>,
    names: Vec<String>,
}

impl TextExporter {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        Ok(TextExporter {
            writer: open_output(path)?,
            names: Vec::new(),
        })
    }
}

impl Exporter for TextExporter {
    fn fields(&mut self, names: &[String]) -> anyhow::Result<()> {
        self.names = names.to_vec();
        Ok(())
    }

    fn export(
        &mut self,
        template: &Template,
        values: &[Option<FeatureValue>],
        _when: i64,
    ) -> anyhow::Result<()> {
        let mut line = String::new();
        for (position, value) in values.iter().enumerate() {
            if position > 0 {
                line.push_str(", ");
            }
            let name = self
                .names
                .get(position)
                .map(String::as_str)
                .unwrap_or_else(|| template.elements[position].name.as_str());
            line.push_str(name);
            line.push('=');
            match value {
                Some(v) => line.push_str(&v.to_string()),
                None => line.push_str("null"),
            }
        }
        writeln!(self.writer, "{line}")?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
