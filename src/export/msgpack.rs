use std::io::Write;

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::feature::types::FeatureValue;
use crate::template::Template;

use super::{open_output, Exporter};

/// MessagePack output: one array of field names, then one array per
/// record. Numbers keep their native width, addresses become byte
/// arrays, null features become nil.
pub struct MsgpackExporter {
    writer: Box<dyn Write + Send>,
}

impl MsgpackExporter {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        Ok(MsgpackExporter {
            writer: open_output(path)?,
        })
    }
}

struct MsgValue<'a>(&'a Option<FeatureValue>);

impl Serialize for MsgValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            None => serializer.serialize_unit(),
            Some(FeatureValue::Bool(v)) => serializer.serialize_bool(*v),
            Some(FeatureValue::Signed(v)) => serializer.serialize_i64(*v),
            Some(FeatureValue::Unsigned(v)) => serializer.serialize_u64(*v),
            Some(FeatureValue::Float(v)) => serializer.serialize_f64(*v),
            Some(FeatureValue::Bytes(b)) => serializer.serialize_bytes(b),
            Some(FeatureValue::Ipv4(a)) => serializer.serialize_bytes(&a.octets()),
            Some(FeatureValue::Ipv6(a)) => serializer.serialize_bytes(&a.octets()),
            Some(FeatureValue::DateTimeNanos(v)) => serializer.serialize_i64(*v),
            Some(FeatureValue::List(items)) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    let owned = Some(item.clone());
                    seq.serialize_element(&MsgValue(&owned))?;
                }
                seq.end()
            }
        }
    }
}

impl Exporter for MsgpackExporter {
    fn fields(&mut self, names: &[String]) -> anyhow::Result<()> {
        rmp_serde::encode::write(&mut self.writer, names)?;
        Ok(())
    }

    fn export(
        &mut self,
        _template: &Template,
        values: &[Option<FeatureValue>],
        _when: i64,
    ) -> anyhow::Result<()> {
        let row: Vec<MsgValue> = values.iter().map(MsgValue).collect();
        rmp_serde::encode::write(&mut self.writer, &row)?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
