//! DHCP wire format: fixed BOOTP-style payload plus the variable-length
//! options list.

use crate::{enum_with_unknown, IpV4Addr, MacAddr};
use byte_struct::*;
use ufmt::derive::uDebug;

use super::{DhcpError, DhcpErrorKind};

/// "Magic Cookie" placed at the end of the fixed portion of the DHCP
/// payload. The reference implementation's value differs from the
/// RFC-2131 standard cookie (`0x63_82_53_63`) by a byte swap in the middle
/// two bytes; this follows the reference value so packets interop with
/// existing deployments.
pub const DHCP_COOKIE: u32 = 0x63_53_82_63;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Minimum total size the reference client pads a DISCOVER/REQUEST out to.
pub const DHCP_MIN_MESSAGE_SIZE: usize = 300;

/// The fixed-length part of the DHCP payload, per BOOTP/RFC-2131 section 2.
#[derive(ByteStruct, Debug, Clone, Copy, PartialEq, Eq)]
#[byte_struct_be]
pub struct DhcpFixedPayload {
    /// Message op code / message type. 1 = BOOTREQUEST, 2 = BOOTREPLY
    pub op: DhcpOperation,
    /// Hardware type, always 1 for ethernet
    pub htype: u8,
    /// Hardware address length, always 6 for a standard MAC address
    pub hlen: u8,
    /// Legacy field, always 0
    pub hops: u8,
    /// Transaction ID, chosen by the client and echoed by the server
    pub xid: u32,
    /// Seconds elapsed since the client started this transaction
    pub secs: u16,
    /// Broadcast flag: 1 for broadcast, 0 for unicast
    pub flags: u16,
    /// Client IP address, set only during renewal
    pub ciaddr: IpV4Addr,
    /// "Your" IP address, offered or leased to the client
    pub yiaddr: IpV4Addr,
    /// Next-server IP address
    pub siaddr: IpV4Addr,
    /// Relay agent IP address
    pub giaddr: IpV4Addr,
    /// Client hardware address; only the first 6 bytes are meaningful for
    /// a standard MAC, the rest is padding
    pub chaddr: MacAddr,
    _chaddr_pad: [u8; 10],
    /// Server host name (unused, legacy BOOTP field)
    _sname: [u8; 64],
    /// Boot file name (unused, legacy BOOTP field)
    _file: [u8; 128],
    /// Identifies this payload as DHCP rather than plain BOOTP
    pub cookie: u32,
}

impl DhcpFixedPayload {
    /// Build the fixed portion of a client message.
    pub fn new(
        op: DhcpOperation,
        xid: u32,
        broadcast: bool,
        ciaddr: IpV4Addr,
        chaddr: MacAddr,
    ) -> Self {
        DhcpFixedPayload {
            op,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: if broadcast { 0x8000 } else { 0 },
            ciaddr,
            yiaddr: IpV4Addr::ANY,
            siaddr: IpV4Addr::ANY,
            giaddr: IpV4Addr::ANY,
            chaddr,
            _chaddr_pad: [0; 10],
            _sname: [0; 64],
            _file: [0; 128],
            cookie: DHCP_COOKIE,
        }
    }

    /// Pack into a big-endian byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }
}

impl uDebug for DhcpFixedPayload {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite + ?Sized,
    {
        f.debug_struct("DhcpFixedPayload")?
            .field("op", &self.op)?
            .field("htype", &self.htype)?
            .field("hlen", &self.hlen)?
            .field("hops", &self.hops)?
            .field("xid", &self.xid)?
            .field("secs", &self.secs)?
            .field("flags", &self.flags)?
            .field("ciaddr", &self.ciaddr)?
            .field("yiaddr", &self.yiaddr)?
            .field("siaddr", &self.siaddr)?
            .field("giaddr", &self.giaddr)?
            .field("chaddr", &self.chaddr)?
            .field("_chaddr_pad", &self._chaddr_pad)?
            .field("_sname", &&self._sname[..])?
            .field("_file", &&self._file[..])?
            .field("cookie", &self.cookie)?
            .finish()
    }
}

enum_with_unknown! {
    /// Message op code / message type. Legacy field from BOOTP; still has
    /// to be set and to match the message kind even though there's only
    /// one valid combination of the two per message.
    pub enum DhcpOperation(u8) {
        /// Anything coming from the client
        Request = 1,
        /// Anything coming from the server
        Reply = 2
    }
}

impl ByteStructLen for DhcpOperation {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for DhcpOperation {
    fn read_bytes(bytes: &[u8]) -> Self {
        Self::from(bytes[0])
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = u8::from(*self);
    }
}

enum_with_unknown! {
    /// Contents of option 53, identifying the kind of DHCP message.
    #[allow(missing_docs)]
    pub enum DhcpMessageKind(u8) {
        Discover = 1,
        Offer = 2,
        Request = 3,
        Decline = 4,
        Ack = 5,
        Nak = 6,
        Release = 7,
        Inform = 8,
        ForceRenew = 9,
        LeaseQuery = 10,
        LeaseUnassigned = 11,
        LeaseUnknown = 12,
        LeaseActive = 13,
        BulkLeaseQuery = 14,
        LeaseQueryDone = 15,
        ActiveLeaseQuery = 16,
        LeaseQueryStatus = 17,
        Tls = 18
    }
}

enum_with_unknown! {
    /// Option type codes for parsing the options section. Most of these
    /// are never produced or consumed by this client; they're listed so
    /// an unrecognized option can still round-trip through `Unknown`.
    #[allow(missing_docs)]
    pub enum DhcpOptionKind(u8) {
        Pad = 0,
        SubnetMask = 1,
        TimeOffset = 2,
        Router = 3,
        TimeServer = 4,
        NameServer = 5,
        DomainNameServers = 6,
        HostName = 12,
        DomainName = 15,
        RequestedIpAddress = 50,
        IpAddressLeaseTime = 51,
        OptionOverload = 52,
        DhcpMessageType = 53,
        ServerIdentifier = 54,
        ParameterRequestList = 55,
        Message = 56,
        MaxDhcpMessageSize = 57,
        RenewalTime = 58,
        RebindingTime = 59,
        VendorClassId = 60,
        ClientId = 61,
        TftpServerName = 62,
        BootFileName = 63,
        End = 255,
    }
}

/// Overload flag values for option 52: the `file` and/or `sname` fixed
/// fields are reused to carry more options when the primary options area
/// isn't big enough.
pub mod overload {
    pub const FILE: u8 = 1;
    pub const SNAME: u8 = 2;
    pub const BOTH: u8 = 3;
}

/// The subset of option data this client extracts from a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DhcpData {
    pub message_kind: Option<DhcpMessageKind>,
    pub subnet_mask: Option<IpV4Addr>,
    pub router: Option<IpV4Addr>,
    pub dns_server: Option<IpV4Addr>,
    pub server_ip: Option<IpV4Addr>,
    pub ip_lease_time: Option<u32>,
}

/// Parse the options area of a DHCP message, honoring `OPTION_OVERLOAD` by
/// re-scanning `sname`/`file` from the fixed payload after the primary
/// options region, matching `dhcp.c:dhcp_v_get_data`/`scan_options`.
pub fn parse_options(fixed_bytes: &[u8], options: &[u8]) -> Result<DhcpData, DhcpError> {
    if fixed_bytes.len() < DhcpFixedPayload::BYTE_LEN {
        return Err(DhcpErrorKind::Truncated.into());
    }

    let mut data = DhcpData::default();
    let mut overload_flag = 0_u8;

    scan_option_region(options, &mut data, &mut overload_flag);

    // Layout offsets within the fixed payload: chaddr+pad end at byte 44,
    // sname occupies [44, 108), file occupies [108, 236).
    const SNAME_START: usize = 44;
    const SNAME_END: usize = SNAME_START + 64;
    const FILE_END: usize = SNAME_END + 128;

    if overload_flag & overload::SNAME != 0 {
        scan_option_region(&fixed_bytes[SNAME_START..SNAME_END], &mut data, &mut 0);
    }
    if overload_flag & overload::FILE != 0 {
        scan_option_region(&fixed_bytes[SNAME_END..FILE_END], &mut data, &mut 0);
    }

    Ok(data)
}

fn scan_option_region(region: &[u8], data: &mut DhcpData, overload_flag: &mut u8) {
    let mut i = 0;
    while i < region.len() {
        let kind = DhcpOptionKind::from(region[i]);
        if kind == DhcpOptionKind::Pad {
            i += 1;
            continue;
        }
        if kind == DhcpOptionKind::End {
            break;
        }
        if i + 1 >= region.len() {
            break;
        }
        let len = region[i + 1] as usize;
        let start = i + 2;
        if start + len > region.len() {
            break;
        }
        let value = &region[start..start + len];

        match kind {
            DhcpOptionKind::DhcpMessageType if len == 1 => {
                data.message_kind = Some(DhcpMessageKind::from(value[0]));
            }
            DhcpOptionKind::SubnetMask if len == 4 => {
                data.subnet_mask = Some(IpV4Addr::new(value.try_into().unwrap()));
            }
            DhcpOptionKind::Router if len >= 4 => {
                data.router = Some(IpV4Addr::new(value[0..4].try_into().unwrap()));
            }
            DhcpOptionKind::DomainNameServers if len >= 4 => {
                data.dns_server = Some(IpV4Addr::new(value[0..4].try_into().unwrap()));
            }
            DhcpOptionKind::ServerIdentifier if len == 4 => {
                data.server_ip = Some(IpV4Addr::new(value.try_into().unwrap()));
            }
            DhcpOptionKind::IpAddressLeaseTime if len == 4 => {
                data.ip_lease_time = Some(u32::from_be_bytes(value.try_into().unwrap()));
            }
            DhcpOptionKind::OptionOverload if len == 1 => {
                *overload_flag = value[0];
            }
            _ => {}
        }

        i = start + len;
    }
}

/// Append a TLV option.
fn push_option(buf: &mut Vec<u8>, kind: DhcpOptionKind, value: &[u8]) {
    buf.push(u8::from(kind));
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
}

/// Build a DHCPDISCOVER message: fixed payload + options, padded to
/// [`DHCP_MIN_MESSAGE_SIZE`] as the reference client does.
pub fn build_discover(
    xid: u32,
    chaddr: MacAddr,
    client_id: &[u8],
    hostname: &str,
    requested_ip: Option<IpV4Addr>,
) -> Vec<u8> {
    let fixed = DhcpFixedPayload::new(DhcpOperation::Request, xid, true, IpV4Addr::ANY, chaddr);
    let mut buf = fixed.to_be_bytes().to_vec();

    push_option(&mut buf, DhcpOptionKind::DhcpMessageType, &[DhcpMessageKind::Discover.into()]);
    if let Some(ip) = requested_ip {
        push_option(&mut buf, DhcpOptionKind::RequestedIpAddress, &ip.to_be_bytes());
    }
    let mut client_id_value = Vec::with_capacity(client_id.len() + 1);
    client_id_value.push(0); // hardware type byte preceding the raw identifier
    client_id_value.extend_from_slice(client_id);
    push_option(&mut buf, DhcpOptionKind::ClientId, &client_id_value);
    push_option(&mut buf, DhcpOptionKind::HostName, hostname.as_bytes());
    push_option(
        &mut buf,
        DhcpOptionKind::ParameterRequestList,
        &[
            u8::from(DhcpOptionKind::SubnetMask),
            u8::from(DhcpOptionKind::Router),
            u8::from(DhcpOptionKind::DomainNameServers),
        ],
    );
    buf.push(u8::from(DhcpOptionKind::End));

    buf.resize(buf.len().max(DHCP_MIN_MESSAGE_SIZE), 0);
    buf
}

/// Build a DHCPREQUEST message for the offer identified by `offered_ip` /
/// `server_ip`.
pub fn build_request(
    xid: u32,
    chaddr: MacAddr,
    client_id: &[u8],
    hostname: &str,
    offered_ip: IpV4Addr,
    server_ip: IpV4Addr,
) -> Vec<u8> {
    let fixed = DhcpFixedPayload::new(DhcpOperation::Request, xid, true, IpV4Addr::ANY, chaddr);
    let mut buf = fixed.to_be_bytes().to_vec();

    push_option(&mut buf, DhcpOptionKind::DhcpMessageType, &[DhcpMessageKind::Request.into()]);
    push_option(&mut buf, DhcpOptionKind::RequestedIpAddress, &offered_ip.to_be_bytes());
    push_option(&mut buf, DhcpOptionKind::ServerIdentifier, &server_ip.to_be_bytes());
    let mut client_id_value = Vec::with_capacity(client_id.len() + 1);
    client_id_value.push(0);
    client_id_value.extend_from_slice(client_id);
    push_option(&mut buf, DhcpOptionKind::ClientId, &client_id_value);
    push_option(&mut buf, DhcpOptionKind::HostName, hostname.as_bytes());
    push_option(
        &mut buf,
        DhcpOptionKind::ParameterRequestList,
        &[
            u8::from(DhcpOptionKind::SubnetMask),
            u8::from(DhcpOptionKind::Router),
            u8::from(DhcpOptionKind::DomainNameServers),
        ],
    );
    buf.push(u8::from(DhcpOptionKind::End));

    buf.resize(buf.len().max(DHCP_MIN_MESSAGE_SIZE), 0);
    buf
}

/// Split a raw received message into its fixed payload and options area,
/// validating the magic cookie and that it's addressed to our `xid`.
pub fn parse_message(bytes: &[u8], expected_xid: u32) -> Result<(DhcpFixedPayload, DhcpData), DhcpError> {
    if bytes.len() < DhcpFixedPayload::BYTE_LEN {
        return Err(DhcpErrorKind::Truncated.into());
    }
    let fixed = DhcpFixedPayload::read_bytes(&bytes[0..DhcpFixedPayload::BYTE_LEN]);
    if fixed.cookie != DHCP_COOKIE {
        return Err(DhcpErrorKind::Truncated.into());
    }
    if fixed.xid != expected_xid {
        return Err(DhcpErrorKind::XidMismatch.into());
    }
    let data = parse_options(&bytes[0..DhcpFixedPayload::BYTE_LEN], &bytes[DhcpFixedPayload::BYTE_LEN..])?;
    Ok((fixed, data))
}
