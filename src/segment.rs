//! The 20-byte TCP header and the owned, refcounted packet buffer built
//! around it. Bit layout matches classic TCP but trimmed to the six
//! control bits this stack actually uses; IP-layer framing is left to
//! `etherparse`, which the rest of the crate already depends on for the
//! pseudo-header addresses.

use std::sync::Arc;

use bitflags::bitflags;

/// Fixed header length on the wire; the data-offset field always encodes 5.
pub const HEADER_LEN: usize = 20;

bitflags! {
    /// Control bits, packed LSB-first starting at bit 0: URG, ACK, PSH,
    /// RST, SYN, FIN.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct Flags: u16 {
        const URG = 1 << 0;
        const ACK = 1 << 1;
        const PSH = 1 << 2;
        const RST = 1 << 3;
        const SYN = 1 << 4;
        const FIN = 1 << 5;
    }
}

/// The TCP header, held host-endian once parsed. Converted to/from
/// network-endian only at the wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl Header {
    /// Parses a 20-byte network-endian header into a host-endian `Header`.
    /// Converts a wire-order header into host-order fields.
    pub fn to_host(bytes: &[u8; HEADER_LEN]) -> Header {
        let data_offset_word = u16::from_be_bytes([bytes[12], bytes[13]]);
        Header {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ack: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: Flags::from_bits_truncate(data_offset_word & 0x003F),
            window: u16::from_be_bytes([bytes[14], bytes[15]]),
            checksum: u16::from_be_bytes([bytes[16], bytes[17]]),
            urgent_ptr: u16::from_be_bytes([bytes[18], bytes[19]]),
        }
    }

    /// Serializes a host-endian `Header` to its 20-byte network-endian wire
    /// form for the wire.
    pub fn to_network(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        let data_offset_word: u16 = (5u16 << 12) | self.flags.bits();
        out[12..14].copy_from_slice(&data_offset_word.to_be_bytes());
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        out
    }
}

/// The pseudo-header used solely to compute the checksum; never
/// transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub protocol: u8,
    pub tcp_len: u16,
}

impl PseudoHeader {
    pub const PROTOCOL_TCP: u8 = 6;
}

fn sum16(pseudo: &PseudoHeader, header_bytes: &[u8; HEADER_LEN], payload: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    sum += pseudo.src_ip >> 16;
    sum += pseudo.src_ip & 0xFFFF;
    sum += pseudo.dst_ip >> 16;
    sum += pseudo.dst_ip & 0xFFFF;
    sum += pseudo.protocol as u32;
    sum += pseudo.tcp_len as u32;

    for chunk in header_bytes.chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    let mut iter = payload.chunks(2);
    for chunk in &mut iter {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum
}

/// Computes the checksum for a packet about to be sent: the checksum field
/// is treated as zero while summing, per the ones'-complement rule.
pub fn checksum(pseudo: &PseudoHeader, header: &Header, payload: &[u8]) -> u16 {
    let mut zeroed = *header;
    zeroed.checksum = 0;
    let sum = sum16(pseudo, &zeroed.to_network(), payload);
    !(sum as u16)
}

/// Verifies a received packet's checksum: summing over the header exactly
/// as received (checksum field included) must fold to zero.
pub fn verify_checksum(pseudo: &PseudoHeader, header: &Header, payload: &[u8]) -> bool {
    let sum = sum16(pseudo, &header.to_network(), payload);
    sum == 0xFFFF
}

/// An owned, refcounted packet: header plus payload. Cheap to `Clone`
/// (bumps the `Arc`) so the same bytes can sit on the wire and in a
/// retransmission timer simultaneously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketData {
    pub header: Header,
    pub payload: Vec<u8>,
}

pub type Packet = Arc<PacketData>;

pub fn make_packet(header: Header, payload: Vec<u8>) -> Packet {
    Arc::new(PacketData { header, payload })
}

impl PacketData {
    /// Sequence number range `[seq, seq + logical_len)` this packet
    /// occupies, where `logical_len` also counts a set SYN/FIN bit as one
    /// sequence number each.
    pub fn seq_range(&self) -> std::ops::Range<u32> {
        let mut len = self.payload.len() as u32;
        if self.header.flags.contains(Flags::SYN) {
            len += 1;
        }
        if self.header.flags.contains(Flags::FIN) {
            len += 1;
        }
        self.header.seq..self.header.seq.wrapping_add(len)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.header.to_network());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            src_port: 4242,
            dst_port: 9090,
            seq: 100,
            ack: 200,
            flags: Flags::ACK | Flags::PSH,
            window: 1024,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    #[test]
    fn network_host_round_trip() {
        let header = sample_header();
        let bytes = header.to_network();
        let parsed = Header::to_host(&bytes);
        assert_eq!(parsed, header);
        assert_eq!(Header::to_host(&bytes).to_network(), bytes);
    }

    #[test]
    fn data_offset_is_five() {
        let bytes = sample_header().to_network();
        let word = u16::from_be_bytes([bytes[12], bytes[13]]);
        assert_eq!(word >> 12, 5);
    }

    #[test]
    fn checksum_then_verify_is_zero() {
        let pseudo = PseudoHeader {
            src_ip: 0x0A0A0A01,
            dst_ip: 0x0A0A0A02,
            protocol: PseudoHeader::PROTOCOL_TCP,
            tcp_len: 5,
        };
        let mut header = sample_header();
        let payload = b"Hello".to_vec();

        header.checksum = checksum(&pseudo, &header, &payload);
        assert!(verify_checksum(&pseudo, &header, &payload));
    }

    #[test]
    fn corrupted_checksum_fails_verification() {
        let pseudo = PseudoHeader {
            src_ip: 1,
            dst_ip: 2,
            protocol: PseudoHeader::PROTOCOL_TCP,
            tcp_len: 0,
        };
        let mut header = sample_header();
        header.checksum = checksum(&pseudo, &header, &[]);
        header.checksum ^= 0xFFFF;

        assert!(!verify_checksum(&pseudo, &header, &[]));
    }

    #[test]
    fn seq_range_counts_syn_and_fin() {
        let mut header = sample_header();
        header.flags = Flags::SYN;
        let packet = make_packet(header, vec![]);
        assert_eq!(packet.seq_range(), 100..101);
    }
}
