//! Internet layer: IPv4 header construction, verification, and TTL handling.

use crate::{calc_ip_checksum, IpV4Addr, Protocol};

use byte_struct::*;

bitfields!(
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    Fragmentation: u16 {
        unused: 1,
        pub do_not_fragment: 1,
        pub more_fragments: 2,
        pub offset: 13
    }
);

bitfields!(
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    VersionAndHeaderLength: u8 {
        pub version: 4,
        pub header_length: 4
    }
);

impl Fragmentation {
    pub fn new() -> Self {
        Self::from_raw(0)
    }
    pub fn offset(&self) -> u16 {
        self.offset
    }
    pub fn more_fragments(&self) -> u16 {
        self.more_fragments
    }
    pub fn set_offset(&mut self, offset: u16) {
        self.offset = offset;
    }
}

impl VersionAndHeaderLength {
    pub fn new() -> Self {
        Self::from_raw(0)
    }
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }
    pub fn with_header_length(mut self, header_length: u8) -> Self {
        self.header_length = header_length;
        self
    }
    pub fn version(&self) -> u8 {
        self.version
    }
    pub fn header_length(&self) -> u8 {
        self.header_length
    }
}

/// Minimum legal total IPv4 packet size: the 20-byte fixed header alone.
pub const MIN_IP_PACKET_SIZE: usize = IpV4Header::BYTE_LEN;
/// Largest packet this gateway will forward; larger values are rejected by
/// [`verify_header`] rather than fragmented, since fragmentation is not
/// supported.
pub const MAX_IP_PACKET_SIZE: usize = 1500;
/// Default time-to-live applied to packets this gateway originates.
pub const DEFAULT_TTL: u8 = 64;

/// IPv4 header per IETF-RFC-791.
///
/// See <https://en.wikipedia.org/wiki/IPv4>.
#[derive(ByteStruct, Clone, Debug, PartialEq)]
#[byte_struct_be]
pub struct IpV4Header {
    pub version_and_length: VersionAndHeaderLength,
    pub dscp: crate::DSCP,
    pub total_length: u16,
    pub identification: u16,
    pub fragmentation: Fragmentation,
    pub time_to_live: u8,
    pub protocol: Protocol,
    pub checksum: u16,
    pub src_ipaddr: IpV4Addr,
    pub dst_ipaddr: IpV4Addr,
}

impl IpV4Header {
    /// Pack into a big-endian (network) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut header_bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut header_bytes);
        header_bytes
    }

    /// Recompute and store this header's own checksum, zeroing the field
    /// first the way [`crate::icmp::ip_header_checksum`] expects.
    pub fn fill_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = calc_ip_checksum(&self.to_be_bytes());
    }
}

/// Reasons a received IPv4 header is not acceptable for forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpHeaderError {
    /// Not version 4, or header length field is out of range for our
    /// fixed 20-byte header (we never read IP options).
    BadVersionOrLength,
    /// `total_length` is smaller than the header or larger than
    /// [`MAX_IP_PACKET_SIZE`].
    BadTotalLength,
    /// The fragmentation offset is nonzero, or `more_fragments` is set —
    /// reassembly is not supported.
    Fragmented,
    /// Protocol is not one of ICMP/UDP/TCP.
    UnsupportedProtocol,
    /// Header checksum does not match its contents.
    BadChecksum,
}

/// Validate a received IPv4 header against the subset of RFC 791 this
/// gateway understands: fixed-length header only, no fragmentation, and
/// only ICMP/UDP/TCP payloads.
pub fn verify_header(header: &IpV4Header, total_packet_len: usize) -> Result<(), IpHeaderError> {
    if header.version_and_length.version() != 4
        || header.version_and_length.header_length() as usize * 4 != IpV4Header::BYTE_LEN
    {
        return Err(IpHeaderError::BadVersionOrLength);
    }

    let total_length = header.total_length as usize;
    if total_length < IpV4Header::BYTE_LEN
        || total_length > MAX_IP_PACKET_SIZE
        || total_length > total_packet_len
    {
        return Err(IpHeaderError::BadTotalLength);
    }

    if header.fragmentation.offset() != 0 || header.fragmentation.more_fragments() != 0 {
        return Err(IpHeaderError::Fragmented);
    }

    match header.protocol {
        Protocol::Icmp | Protocol::Udp | Protocol::Tcp => {}
        Protocol::Unimplemented => return Err(IpHeaderError::UnsupportedProtocol),
    }

    if calc_ip_checksum(&header.to_be_bytes()) != 0 {
        return Err(IpHeaderError::BadChecksum);
    }

    Ok(())
}

/// Build a new, checksummed IPv4 header for a packet we originate.
///
/// `identification` should be a monotonically increasing per-gateway
/// counter; `payload_len` is the length of everything after this header.
pub fn init_header(
    src_ipaddr: IpV4Addr,
    dst_ipaddr: IpV4Addr,
    protocol: Protocol,
    identification: u16,
    payload_len: usize,
) -> IpV4Header {
    // A reply addressed to loopback carries loopback as its own source too,
    // matching `ip_v_init_header`.
    let src_ipaddr = if dst_ipaddr.is_loopback() {
        dst_ipaddr
    } else {
        src_ipaddr
    };
    let mut header = IpV4Header {
        version_and_length: VersionAndHeaderLength::new()
            .with_version(4)
            .with_header_length((IpV4Header::BYTE_LEN / 4) as u8),
        dscp: crate::DSCP::Standard,
        total_length: (IpV4Header::BYTE_LEN + payload_len) as u16,
        identification,
        fragmentation: Fragmentation::new(),
        time_to_live: DEFAULT_TTL,
        protocol,
        checksum: 0,
        src_ipaddr,
        dst_ipaddr,
    };
    header.fill_checksum();
    header
}

/// Outcome of decrementing a packet's TTL on the forwarding path.
pub enum TtlOutcome {
    /// TTL was decremented in place and the checksum recomputed; forward it.
    Forward,
    /// TTL reached zero. The caller should send an ICMP TIME_EXCEEDED back
    /// to the source (only meaningful when the packet itself wasn't ICMP)
    /// and drop the original.
    Expired,
}

/// Decrement a header's TTL by one, recomputing the checksum, matching
/// `gateway.c`'s `process_ttl`. Returns [`TtlOutcome::Expired`] without
/// mutating `header` further once TTL has reached zero (the caller restores
/// TTL to 1 before embedding the header in an ICMP reply).
pub fn process_ttl(header: &mut IpV4Header) -> TtlOutcome {
    if header.time_to_live == 0 {
        return TtlOutcome::Expired;
    }
    header.time_to_live -= 1;
    if header.time_to_live == 0 {
        return TtlOutcome::Expired;
    }
    header.fill_checksum();
    TtlOutcome::Forward
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MacAddr;

    #[test]
    fn init_header_checksum_validates() {
        let header = init_header(
            IpV4Addr::new([10, 0, 0, 1]),
            IpV4Addr::new([10, 0, 0, 2]),
            Protocol::Udp,
            7,
            8,
        );
        assert!(verify_header(&header, IpV4Header::BYTE_LEN + 8).is_ok());
    }

    #[test]
    fn verify_rejects_fragmented_packet() {
        let mut header = init_header(
            IpV4Addr::new([10, 0, 0, 1]),
            IpV4Addr::new([10, 0, 0, 2]),
            Protocol::Udp,
            1,
            0,
        );
        header.fragmentation.set_offset(1);
        header.fill_checksum();
        assert_eq!(
            verify_header(&header, IpV4Header::BYTE_LEN),
            Err(IpHeaderError::Fragmented)
        );
    }

    #[test]
    fn verify_rejects_unsupported_protocol() {
        let mut header = init_header(
            IpV4Addr::new([10, 0, 0, 1]),
            IpV4Addr::new([10, 0, 0, 2]),
            Protocol::Udp,
            1,
            0,
        );
        header.protocol = Protocol::Unimplemented;
        header.fill_checksum();
        assert_eq!(
            verify_header(&header, IpV4Header::BYTE_LEN),
            Err(IpHeaderError::UnsupportedProtocol)
        );
    }

    #[test]
    fn ttl_reaching_zero_is_reported_as_expired() {
        let mut header = init_header(IpV4Addr::ANY, IpV4Addr::ANY, Protocol::Udp, 1, 0);
        header.time_to_live = 1;
        assert!(matches!(process_ttl(&mut header), TtlOutcome::Expired));
    }

    #[test]
    fn ttl_decrements_and_rechecksums() {
        let mut header = init_header(IpV4Addr::ANY, IpV4Addr::ANY, Protocol::Udp, 1, 0);
        header.time_to_live = 10;
        assert!(matches!(process_ttl(&mut header), TtlOutcome::Forward));
        assert_eq!(header.time_to_live, 9);
        assert_eq!(calc_ip_checksum(&header.to_be_bytes()), 0);
    }

    #[test]
    fn init_header_sets_source_to_dest_for_loopback() {
        let header = init_header(
            IpV4Addr::new([10, 0, 0, 1]),
            IpV4Addr::new([127, 0, 0, 1]),
            Protocol::Udp,
            1,
            0,
        );
        assert_eq!(header.src_ipaddr, IpV4Addr::new([127, 0, 0, 1]));
    }

    #[test]
    fn unrelated_mac_helper_not_needed_here() {
        // sanity: crate::MacAddr is usable from this module's tests
        let _ = MacAddr::ANY;
    }
}
