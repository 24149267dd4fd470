use std::fmt;
use std::net::IpAddr;

use pnet::packet::{
    ethernet::{EtherTypes, EthernetPacket},
    icmp::IcmpPacket,
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    udp::UdpPacket,
    Packet as PnetPacket,
};
use thiserror::Error;

// TCP flag bits as they appear on the wire
pub const FIN_FLAG: u8 = 0b0000_0001;
pub const SYN_FLAG: u8 = 0b0000_0010;
pub const RST_FLAG: u8 = 0b0000_0100;
pub const ACK_FLAG: u8 = 0b0001_0000;

// Linux cooked capture carries the ethertype at offset 14
const SLL_ETHERTYPE_OFFSET: usize = 14;
const SLL_HEADER_LEN: usize = 16;

/// Why a captured frame could not be turned into a [`Packet`].
///
/// The two variants are counted separately: a decode failure means the
/// L2/L3 headers could not be parsed at all, a key failure means the frame
/// parsed but carries no transport endpoints to build a flow key from.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("undecodable frame")]
    Decode,
    #[error("no flow key in packet")]
    Key,
}

/// Canonicalized bidirectional flow key.
///
/// The lower (address, port) endpoint always comes first, so both
/// directions of a connection hash to the same key. Direction is carried
/// on the packet, not in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: u8,
    pub addr_low: IpAddr,
    pub addr_high: IpAddr,
    pub port_low: u16,
    pub port_high: u16,
}

impl FlowKey {
    /// Builds the canonical key for a (src, dst) endpoint pair and reports
    /// whether that pair was already in canonical order (the forward
    /// direction).
    pub fn canonical(
        protocol: u8,
        src_addr: IpAddr,
        src_port: u16,
        dst_addr: IpAddr,
        dst_port: u16,
    ) -> (Self, bool) {
        let forward = (src_addr, src_port) <= (dst_addr, dst_port);
        let key = if forward {
            FlowKey {
                protocol,
                addr_low: src_addr,
                addr_high: dst_addr,
                port_low: src_port,
                port_high: dst_port,
            }
        } else {
            FlowKey {
                protocol,
                addr_low: dst_addr,
                addr_high: src_addr,
                port_low: dst_port,
                port_high: src_port,
            }
        };
        (key, forward)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}-{}",
            self.addr_low, self.port_low, self.addr_high, self.port_high, self.protocol
        )
    }
}

/// One decoded packet, the unit that travels through the shard queues.
///
/// Decoding happens exactly once at the capture boundary; afterwards the
/// packet is moved by value into the shard owning its key, so nothing here
/// is shared or locked.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp in nanoseconds since the epoch.
    pub timestamp_ns: i64,
    pub key: FlowKey,
    /// True when (src addr, src port) is the lower endpoint of the key.
    pub forward: bool,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// Total length of the IP packet in octets.
    pub length: u16,
    /// Transport payload length in octets.
    pub payload_length: u16,
    pub tcp_flags: u8,
    pub sequence_number: u32,
    pub ack_number: u32,
}

impl Packet {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.tcp_flags & flag != 0
    }

    /// Decodes an Ethernet (or Linux cooked) frame into a packet.
    pub fn from_ethernet(data: &[u8], timestamp_ns: i64) -> Result<Self, DecodeError> {
        let ethernet = EthernetPacket::new(data).ok_or(DecodeError::Decode)?;
        match ethernet.get_ethertype() {
            EtherTypes::Ipv4 => {
                let ip = Ipv4Packet::new(ethernet.payload()).ok_or(DecodeError::Decode)?;
                Self::from_ipv4(&ip, timestamp_ns)
            }
            EtherTypes::Ipv6 => {
                let ip = Ipv6Packet::new(ethernet.payload()).ok_or(DecodeError::Decode)?;
                Self::from_ipv6(&ip, timestamp_ns)
            }
            _ => {
                // Fall back to Linux cooked capture framing
                if data.len() <= SLL_HEADER_LEN {
                    return Err(DecodeError::Decode);
                }
                let ethertype = u16::from_be_bytes([
                    data[SLL_ETHERTYPE_OFFSET],
                    data[SLL_ETHERTYPE_OFFSET + 1],
                ]);
                match ethertype {
                    0x0800 => {
                        let ip = Ipv4Packet::new(&data[SLL_HEADER_LEN..])
                            .ok_or(DecodeError::Decode)?;
                        Self::from_ipv4(&ip, timestamp_ns)
                    }
                    0x86DD => {
                        let ip = Ipv6Packet::new(&data[SLL_HEADER_LEN..])
                            .ok_or(DecodeError::Decode)?;
                        Self::from_ipv6(&ip, timestamp_ns)
                    }
                    _ => Err(DecodeError::Decode),
                }
            }
        }
    }

    pub fn from_ipv4(packet: &Ipv4Packet, timestamp_ns: i64) -> Result<Self, DecodeError> {
        from_transport(
            packet.get_source().into(),
            packet.get_destination().into(),
            packet.get_next_level_protocol(),
            timestamp_ns,
            packet.get_total_length(),
            packet.payload(),
        )
    }

    pub fn from_ipv6(packet: &Ipv6Packet, timestamp_ns: i64) -> Result<Self, DecodeError> {
        from_transport(
            packet.get_source().into(),
            packet.get_destination().into(),
            packet.get_next_header(),
            timestamp_ns,
            packet.packet().len() as u16,
            packet.payload(),
        )
    }
}

fn from_transport(
    src_addr: IpAddr,
    dst_addr: IpAddr,
    protocol: IpNextHeaderProtocol,
    timestamp_ns: i64,
    total_length: u16,
    payload: &[u8],
) -> Result<Packet, DecodeError> {
    let (src_port, dst_port, payload_length, tcp_flags, seq, ack) = match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload).ok_or(DecodeError::Key)?;
            (
                tcp.get_source(),
                tcp.get_destination(),
                tcp.payload().len() as u16,
                (tcp.get_flags() & 0xff) as u8,
                tcp.get_sequence(),
                tcp.get_acknowledgement(),
            )
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload).ok_or(DecodeError::Key)?;
            (
                udp.get_source(),
                udp.get_destination(),
                udp.payload().len() as u16,
                0,
                0,
                0,
            )
        }
        IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => {
            let icmp = IcmpPacket::new(payload).ok_or(DecodeError::Key)?;
            // ICMP has no ports; type/code take their place in the key
            (
                icmp.get_icmp_type().0 as u16,
                icmp.get_icmp_code().0 as u16,
                icmp.payload().len() as u16,
                0,
                0,
                0,
            )
        }
        _ => return Err(DecodeError::Key),
    };

    let (key, forward) =
        FlowKey::canonical(protocol.0, src_addr, src_port, dst_addr, dst_port);
    Ok(Packet {
        timestamp_ns,
        key,
        forward,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        protocol: protocol.0,
        length: total_length,
        payload_length,
        tcp_flags,
        sequence_number: seq,
        ack_number: ack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_is_direction_independent() {
        let a: IpAddr = "1.1.1.1".parse().unwrap();
        let b: IpAddr = "2.2.2.2".parse().unwrap();
        let (forward_key, forward) = FlowKey::canonical(6, a, 5, b, 6);
        let (reverse_key, reverse) = FlowKey::canonical(6, b, 6, a, 5);
        assert_eq!(forward_key, reverse_key);
        assert!(forward);
        assert!(!reverse);
    }

    #[test]
    fn same_address_distinct_ports_orders_by_port() {
        let a: IpAddr = "1.1.1.1".parse().unwrap();
        let (key, forward) = FlowKey::canonical(17, a, 9000, a, 53);
        assert!(!forward);
        assert_eq!(key.port_low, 53);
        assert_eq!(key.port_high, 9000);
    }
}
