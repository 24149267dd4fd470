use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};

use crate::feature::types::FeatureValue;
use crate::template::{IeType, InformationElement, Template};

use super::Exporter;

const IPFIX_VERSION: u16 = 10;
const MESSAGE_HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;
const TEMPLATE_SET_ID: u16 = 2;
const FIRST_TEMPLATE_ID: u16 = 256;
// Temporary elements get contiguous ids from this base under this PEN;
// allocation order is stable within a run.
const TEMP_IE_BASE: u16 = 0x7000;
const TEMP_IE_PEN: u32 = 29305;
// seconds between the UNIX and NTP epochs
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

enum Transport {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl Transport {
    fn send(&mut self, message: &[u8]) -> anyhow::Result<()> {
        match self {
            Transport::Udp(socket) => {
                socket.send(message)?;
            }
            Transport::Tcp(stream) => {
                stream.write_all(message)?;
            }
        }
        Ok(())
    }
}

/// IPFIX message stream over UDP or TCP: lazy wire template ids,
/// MTU-bounded messages, periodic template resend driven by wall-clock
/// time (record timing stays packet-time driven).
pub struct IpfixExporter {
    transport: Transport,
    domain: u32,
    mtu: usize,
    /// Data records sent in finished messages; goes into the header.
    sequence: u32,
    /// Encoded sets of the message under construction.
    pending: Vec<u8>,
    pending_records: u32,
    /// Currently open data set: wire template id and offset of its header.
    open_set: Option<(u16, usize)>,
    /// template identity -> wire template id
    wire_ids: HashMap<usize, u16>,
    next_template_id: u16,
    /// Templates as sent, kept for periodic resends.
    sent_templates: Vec<(u16, Vec<InformationElement>)>,
    allocated: HashMap<String, InformationElement>,
    template_interval: Duration,
    templates_last_sent: Instant,
    last_when: i64,
}

impl IpfixExporter {
    pub fn connect(
        target: &str,
        protocol: &str,
        domain: u32,
        mtu: usize,
        template_interval: Duration,
    ) -> anyhow::Result<Self> {
        let transport = match protocol {
            "udp" => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .context("cannot bind local UDP socket")?;
                socket
                    .connect(target)
                    .with_context(|| format!("cannot reach collector {target}"))?;
                Transport::Udp(socket)
            }
            "tcp" => Transport::Tcp(
                TcpStream::connect(target)
                    .with_context(|| format!("cannot connect to collector {target}"))?,
            ),
            other => bail!("unsupported ipfix transport {other:?}"),
        };
        Ok(IpfixExporter {
            transport,
            domain,
            mtu,
            sequence: 0,
            pending: Vec::new(),
            pending_records: 0,
            open_set: None,
            wire_ids: HashMap::new(),
            next_template_id: FIRST_TEMPLATE_ID,
            sent_templates: Vec::new(),
            allocated: HashMap::new(),
            template_interval,
            templates_last_sent: Instant::now(),
            last_when: 0,
        })
    }

    /// Resolves temporary elements (no registered number) to private ids.
    fn allocate_elements(&mut self, elements: &[InformationElement]) -> Vec<InformationElement> {
        elements
            .iter()
            .map(|ie| {
                if ie.id != 0 || ie.pen != 0 {
                    return ie.clone();
                }
                if let Some(known) = self.allocated.get(&ie.name) {
                    return known.clone();
                }
                let assigned = InformationElement {
                    name: ie.name.clone(),
                    id: TEMP_IE_BASE + self.allocated.len() as u16,
                    pen: TEMP_IE_PEN,
                    ty: ie.ty,
                    length: ie.length,
                };
                self.allocated.insert(ie.name.clone(), assigned.clone());
                assigned
            })
            .collect()
    }

    fn wire_template(&mut self, template: &Template) -> u16 {
        if let Some(&id) = self.wire_ids.get(&template.id) {
            return id;
        }
        let id = self.next_template_id;
        self.next_template_id += 1;
        let elements = self.allocate_elements(&template.elements);
        self.append_template_set(id, &elements);
        self.wire_ids.insert(template.id, id);
        self.sent_templates.push((id, elements));
        id
    }

    fn append_template_set(&mut self, wire_id: u16, elements: &[InformationElement]) {
        self.close_set();
        let start = self.pending.len();
        put_u16(&mut self.pending, TEMPLATE_SET_ID);
        put_u16(&mut self.pending, 0); // length, patched below
        put_u16(&mut self.pending, wire_id);
        put_u16(&mut self.pending, elements.len() as u16);
        for ie in elements {
            if ie.pen != 0 {
                put_u16(&mut self.pending, ie.id | 0x8000);
                put_u16(&mut self.pending, ie.length);
                put_u32(&mut self.pending, ie.pen);
            } else {
                put_u16(&mut self.pending, ie.id);
                put_u16(&mut self.pending, ie.length);
            }
        }
        let length = (self.pending.len() - start) as u16;
        self.pending[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
    }

    fn close_set(&mut self) {
        if let Some((_, start)) = self.open_set.take() {
            let length = (self.pending.len() - start) as u16;
            self.pending[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
        }
    }

    fn flush_message(&mut self, when: i64) -> anyhow::Result<()> {
        self.close_set();
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut message = Vec::with_capacity(MESSAGE_HEADER_LEN + self.pending.len());
        put_u16(&mut message, IPFIX_VERSION);
        put_u16(&mut message, (MESSAGE_HEADER_LEN + self.pending.len()) as u16);
        put_u32(&mut message, (when / 1_000_000_000).max(0) as u32);
        put_u32(&mut message, self.sequence);
        put_u32(&mut message, self.domain);
        message.extend_from_slice(&self.pending);
        self.transport.send(&message)?;
        self.sequence = self.sequence.wrapping_add(self.pending_records);
        self.pending.clear();
        self.pending_records = 0;
        Ok(())
    }

    fn resend_templates(&mut self, when: i64) -> anyhow::Result<()> {
        if self.sent_templates.is_empty()
            || self.templates_last_sent.elapsed() < self.template_interval
        {
            return Ok(());
        }
        self.templates_last_sent = Instant::now();
        let templates = self.sent_templates.clone();
        for (wire_id, elements) in &templates {
            self.append_template_set(*wire_id, elements);
        }
        self.flush_message(when)
    }
}

impl Exporter for IpfixExporter {
    fn fields(&mut self, _names: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn export(
        &mut self,
        template: &Template,
        values: &[Option<FeatureValue>],
        when: i64,
    ) -> anyhow::Result<()> {
        self.resend_templates(when)?;
        let wire_id = self.wire_template(template);
        let elements = self.allocate_elements(&template.elements);

        let mut record = Vec::new();
        for (ie, value) in elements.iter().zip(values) {
            encode_value(&mut record, ie, value);
        }

        let mismatched_set = self
            .open_set
            .map(|(open_id, _)| open_id != wire_id)
            .unwrap_or(false);
        let projected =
            MESSAGE_HEADER_LEN + self.pending.len() + SET_HEADER_LEN + record.len();
        if mismatched_set || projected > self.mtu {
            self.flush_message(when)?;
        }

        if self.open_set.is_none() {
            let start = self.pending.len();
            put_u16(&mut self.pending, wire_id);
            put_u16(&mut self.pending, 0); // length, patched on close
            self.open_set = Some((wire_id, start));
        }
        self.pending.extend_from_slice(&record);
        self.pending_records += 1;
        self.last_when = when;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        let when = self.last_when;
        self.flush_message(when)
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Encodes one value for its Information Element: fixed-length fields use
/// reduced-size encoding, variable-length fields get the RFC 7011 length
/// prefix. Null values encode as zeros (or an empty variable field).
fn encode_value(out: &mut Vec<u8>, ie: &InformationElement, value: &Option<FeatureValue>) {
    if ie.length == 0xFFFF {
        let content = match value {
            Some(FeatureValue::Bytes(b)) => b.clone(),
            Some(other) => {
                let mut buf = Vec::new();
                other.write_canonical(&mut buf);
                buf
            }
            None => Vec::new(),
        };
        if content.len() < 255 {
            out.push(content.len() as u8);
        } else {
            out.push(255);
            put_u16(out, content.len() as u16);
        }
        out.extend_from_slice(&content);
        return;
    }

    let len = ie.length as usize;
    match (ie.ty, value) {
        (IeType::Ipv4Address, Some(FeatureValue::Ipv4(a))) => out.extend_from_slice(&a.octets()),
        (IeType::Ipv6Address, Some(FeatureValue::Ipv6(a))) => out.extend_from_slice(&a.octets()),
        (IeType::Boolean, Some(FeatureValue::Bool(v))) => out.push(if *v { 1 } else { 2 }),
        (IeType::Float64, Some(v)) => {
            let f = v.as_number().map(|n| n.to_f64()).unwrap_or(0.0);
            if len == 4 {
                out.extend_from_slice(&(f as f32).to_be_bytes());
            } else {
                out.extend_from_slice(&f.to_be_bytes());
            }
        }
        (IeType::DateTimeNanoseconds, Some(v)) => {
            let ns = match v {
                FeatureValue::DateTimeNanos(t) => *t,
                other => other.as_number().map(|n| n.to_i64()).unwrap_or(0),
            };
            out.extend_from_slice(&ntp_timestamp(ns).to_be_bytes());
        }
        (IeType::Signed64, Some(v)) => {
            let bits = v.as_number().map(|n| n.to_i64()).unwrap_or(0) as u64;
            put_reduced(out, bits, len);
        }
        (_, Some(v)) => {
            let bits = match v.as_number() {
                Some(n) => match n {
                    crate::feature::types::Number::Unsigned(u) => u,
                    other => other.to_i64() as u64,
                },
                None => 0,
            };
            put_reduced(out, bits, len);
        }
        (_, None) => out.extend(std::iter::repeat(0u8).take(len)),
    }
}

fn put_reduced(out: &mut Vec<u8>, bits: u64, len: usize) {
    let bytes = bits.to_be_bytes();
    out.extend_from_slice(&bytes[bytes.len().saturating_sub(len)..]);
}

/// 64-bit NTP timestamp: seconds since 1900 plus a 2^-32 fraction.
fn ntp_timestamp(ns: i64) -> u64 {
    let ns = ns.max(0) as u64;
    let seconds = ns / 1_000_000_000 + NTP_EPOCH_OFFSET;
    let fraction = ((ns % 1_000_000_000) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_length_keeps_low_bytes() {
        let mut out = Vec::new();
        put_reduced(&mut out, 0x0102_0304, 2);
        assert_eq!(out, vec![0x03, 0x04]);
    }

    #[test]
    fn ntp_epoch_is_1900() {
        assert_eq!(ntp_timestamp(0) >> 32, NTP_EPOCH_OFFSET);
        // half a second is half the fraction range
        let half = ntp_timestamp(500_000_000) & 0xFFFF_FFFF;
        assert_eq!(half, 1u64 << 31);
    }

    #[test]
    fn fixed_length_null_encodes_as_zeros() {
        let ie = InformationElement {
            name: "packetTotalCount".into(),
            id: 86,
            pen: 0,
            ty: IeType::Unsigned64,
            length: 8,
        };
        let mut out = Vec::new();
        encode_value(&mut out, &ie, &None);
        assert_eq!(out, vec![0u8; 8]);
    }

    #[test]
    fn variable_length_gets_a_prefix() {
        let ie = InformationElement::temporary("blob", IeType::OctetArray);
        let mut out = Vec::new();
        encode_value(&mut out, &ie, &Some(FeatureValue::Bytes(vec![1, 2, 3])));
        assert_eq!(out, vec![3, 1, 2, 3]);

        let big = vec![7u8; 300];
        let mut out = Vec::new();
        encode_value(&mut out, &ie, &Some(FeatureValue::Bytes(big.clone())));
        assert_eq!(out[0], 255);
        assert_eq!(u16::from_be_bytes([out[1], out[2]]), 300);
        assert_eq!(&out[3..], big.as_slice());
    }

    #[test]
    fn addresses_encode_as_octets() {
        let ie = InformationElement {
            name: "sourceIPv4Address".into(),
            id: 8,
            pen: 0,
            ty: IeType::Ipv4Address,
            length: 4,
        };
        let mut out = Vec::new();
        encode_value(
            &mut out,
            &ie,
            &Some(FeatureValue::Ipv4("10.0.0.1".parse().unwrap())),
        );
        assert_eq!(out, vec![10, 0, 0, 1]);
    }
}
