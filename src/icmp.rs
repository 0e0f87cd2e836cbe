//! Internet Control Message Protocol: echo reply, TTL-exceeded, and
//! destination-unreachable message construction, per `icmp.c`.
//!
//! This gateway only ever originates these three message types; it never
//! needs redirect, timestamp, or the other historical ICMP types.

use byte_struct::*;

use crate::ip::{init_header, IpV4Header};
use crate::{calc_ip_checksum, IpV4Addr, Protocol};

/// ICMP message header, common to all three message types this gateway
/// produces.
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct IcmpHeader {
    pub kind: IcmpType,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
}

impl IcmpHeader {
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }
}

/// ICMP message type codes this gateway understands or produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestUnreachable = 3,
    EchoRequest = 8,
    TimeExceeded = 11,
    Unimplemented,
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            x if x == IcmpType::EchoReply as u8 => IcmpType::EchoReply,
            x if x == IcmpType::DestUnreachable as u8 => IcmpType::DestUnreachable,
            x if x == IcmpType::EchoRequest as u8 => IcmpType::EchoRequest,
            x if x == IcmpType::TimeExceeded as u8 => IcmpType::TimeExceeded,
            _ => IcmpType::Unimplemented,
        }
    }
}

impl ByteStructLen for IcmpType {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for IcmpType {
    fn read_bytes(bytes: &[u8]) -> Self {
        IcmpType::from(bytes[0])
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = *self as u8;
    }
}

/// Number of bytes of the original datagram's payload to embed in an
/// error reply, per RFC 792.
const ECHOED_PAYLOAD_LEN: usize = 8;

/// Build an ECHO_REPLY for a received ECHO_REQUEST, keeping the same
/// identifier/sequence/data and source/destination swapped.
pub fn build_echo_reply(
    src_ip: IpV4Addr,
    dst_ip: IpV4Addr,
    identifier: u16,
    sequence: u16,
    echo_data: &[u8],
    ip_identification: u16,
) -> Vec<u8> {
    let mut icmp_header = IcmpHeader {
        kind: IcmpType::EchoReply,
        code: 0,
        checksum: 0,
        identifier,
        sequence,
    };
    let mut icmp_bytes = icmp_header.to_be_bytes().to_vec();
    icmp_bytes.extend_from_slice(echo_data);
    icmp_header.checksum = calc_ip_checksum(&icmp_bytes);
    icmp_bytes[2..4].copy_from_slice(&icmp_header.checksum.to_be_bytes());

    let ip_header = init_header(
        src_ip,
        dst_ip,
        Protocol::Icmp,
        ip_identification,
        icmp_bytes.len(),
    );

    let mut packet = ip_header.to_be_bytes().to_vec();
    packet.extend_from_slice(&icmp_bytes);
    packet
}

/// Build a TIME_EXCEEDED message in response to `original_ip_header`
/// (whose TTL has just reached zero), embedding the header and the first
/// [`ECHOED_PAYLOAD_LEN`] bytes of its payload.
///
/// The embedded header's TTL is restored to 1 before embedding, matching
/// `icmp_v_send_ttl_exceeded`, so the embedded header's own checksum still
/// validates even though the live packet's TTL has been decremented to 0.
pub fn build_time_exceeded(
    our_ip: IpV4Addr,
    original_ip_header: &IpV4Header,
    original_payload_prefix: &[u8],
    ip_identification: u16,
) -> Vec<u8> {
    build_error_reply(
        IcmpType::TimeExceeded,
        our_ip,
        original_ip_header,
        original_payload_prefix,
        ip_identification,
    )
}

/// Build a DEST_UNREACHABLE (host unreachable) message for a packet this
/// gateway could not forward, embedding the original header/payload prefix
/// the same way as [`build_time_exceeded`].
pub fn build_dest_unreachable(
    our_ip: IpV4Addr,
    original_ip_header: &IpV4Header,
    original_payload_prefix: &[u8],
    ip_identification: u16,
) -> Vec<u8> {
    build_error_reply(
        IcmpType::DestUnreachable,
        our_ip,
        original_ip_header,
        original_payload_prefix,
        ip_identification,
    )
}

fn build_error_reply(
    kind: IcmpType,
    our_ip: IpV4Addr,
    original_ip_header: &IpV4Header,
    original_payload_prefix: &[u8],
    ip_identification: u16,
) -> Vec<u8> {
    let mut restored_header = original_ip_header.clone();
    restored_header.time_to_live = 1;
    restored_header.fill_checksum();

    let embedded_len = ECHOED_PAYLOAD_LEN.min(original_payload_prefix.len());

    let mut icmp_header = IcmpHeader {
        kind,
        code: 0,
        checksum: 0,
        identifier: 0,
        sequence: 0,
    };
    let mut icmp_bytes = icmp_header.to_be_bytes().to_vec();
    icmp_bytes.extend_from_slice(&restored_header.to_be_bytes());
    icmp_bytes.extend_from_slice(&original_payload_prefix[..embedded_len]);
    icmp_header.checksum = calc_ip_checksum(&icmp_bytes);
    icmp_bytes[2..4].copy_from_slice(&icmp_header.checksum.to_be_bytes());

    let ip_header = init_header(
        our_ip,
        original_ip_header.src_ipaddr,
        Protocol::Icmp,
        ip_identification,
        icmp_bytes.len(),
    );

    let mut packet = ip_header.to_be_bytes().to_vec();
    packet.extend_from_slice(&icmp_bytes);
    packet
}

/// Parse a received ICMP header + payload, returning `None` on a
/// truncated or checksum-invalid message.
pub fn parse(bytes: &[u8]) -> Option<(IcmpHeader, &[u8])> {
    if bytes.len() < IcmpHeader::BYTE_LEN {
        return None;
    }
    if calc_ip_checksum(bytes) != 0 {
        return None;
    }
    Some((
        IcmpHeader::read_bytes(&bytes[0..IcmpHeader::BYTE_LEN]),
        &bytes[IcmpHeader::BYTE_LEN..],
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ip::{verify_header, IpV4Header};

    #[test]
    fn echo_reply_embeds_same_identifier_sequence_and_data() {
        let data = [1_u8, 2, 3, 4];
        let packet = build_echo_reply(
            IpV4Addr::new([10, 0, 0, 1]),
            IpV4Addr::new([10, 0, 0, 2]),
            0xABCD,
            7,
            &data,
            1,
        );
        let header = IpV4Header::read_bytes(&packet[0..IpV4Header::BYTE_LEN]);
        assert!(verify_header(&header, packet.len()).is_ok());
        let (icmp_header, payload) = parse(&packet[IpV4Header::BYTE_LEN..]).unwrap();
        assert_eq!(icmp_header.kind, IcmpType::EchoReply);
        assert_eq!(icmp_header.identifier, 0xABCD);
        assert_eq!(icmp_header.sequence, 7);
        assert_eq!(payload, &data);
    }

    #[test]
    fn time_exceeded_restores_ttl_to_one_in_embedded_header() {
        let mut original = crate::ip::init_header(
            IpV4Addr::new([10, 0, 0, 5]),
            IpV4Addr::new([10, 0, 0, 9]),
            Protocol::Udp,
            1,
            8,
        );
        original.time_to_live = 0;
        original.fill_checksum();

        let payload = [9_u8; 8];
        let packet = build_time_exceeded(IpV4Addr::new([10, 0, 0, 1]), &original, &payload, 2);

        let header = IpV4Header::read_bytes(&packet[0..IpV4Header::BYTE_LEN]);
        assert!(verify_header(&header, packet.len()).is_ok());
        let (icmp_header, icmp_payload) = parse(&packet[IpV4Header::BYTE_LEN..]).unwrap();
        assert_eq!(icmp_header.kind, IcmpType::TimeExceeded);

        let embedded = IpV4Header::read_bytes(&icmp_payload[0..IpV4Header::BYTE_LEN]);
        assert_eq!(embedded.time_to_live, 1);
        assert_eq!(calc_ip_checksum(&embedded.to_be_bytes()), 0);
    }
}
