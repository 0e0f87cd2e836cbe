//! SNTP client per IETF-RFC-4330, unicast mode only.
//!
//! Grounded on `sntp.c`: an NTP timestamp (`NtpTimestamp`) is kept alongside
//! the monotonic clock reading it was synced at (`base_monotonic_ms`), so
//! [`NetworkClock::now`] can project forward between syncs without drifting
//! the stored sync point itself.

use crate::net::{Clock, DnsResolver, UdpTransport};
use crate::IpV4Addr;
use std::cell::Cell;
use std::time::Duration;

pub const SNTP_SERVER_PORT: u16 = 123;
/// Changing (reducing) this violates the RFC.
pub const SNTP_MINIMUM_POLL_INTERVAL_SECS: u32 = 15;
pub const SNTP_DEFAULT_POLL_INTERVAL_SECS: u32 = 60;
pub const SNTP_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const SNTP_TRIES: u8 = 4;

const LI_VN_MODE_CLIENT: u8 = 0b00100011; // version 4, client mode

/// A 64-bit NTP timestamp: seconds since the NTP epoch plus a binary
/// fraction of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    fn to_u64(self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }

    fn from_u64(v: u64) -> Self {
        NtpTimestamp {
            seconds: (v >> 32) as u32,
            fraction: v as u32,
        }
    }

    /// Sentinel used before the first successful sync, matching the
    /// reference client's unsynchronized startup value.
    pub fn unsynced() -> Self {
        NtpTimestamp {
            seconds: 0xD000_0000,
            fraction: 0,
        }
    }

    /// Convert a millisecond duration into an NTP timestamp's worth of
    /// seconds/fraction.
    pub fn from_millis(ms: u32) -> Self {
        NtpTimestamp {
            seconds: ms / 1000,
            fraction: (((ms % 1000) as u64 * 1000 / 1024) as u32) << 22,
        }
    }

    /// Convert to microseconds since the Unix epoch, by subtracting the
    /// fixed 70-year offset between the NTP epoch (1900) and the Unix
    /// epoch (1970).
    pub fn to_unix_micros(self) -> u64 {
        let unix_seconds = (self.seconds as u64).saturating_sub(NTP_UNIX_EPOCH_OFFSET_SECS);
        let frac_micros = (self.fraction as u64 * 1_000_000) >> 32;
        unix_seconds * 1_000_000 + frac_micros
    }
}

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch
/// (1970-01-01), per RFC-4330.
const NTP_UNIX_EPOCH_OFFSET_SECS: u64 = 2_208_988_800;

/// The 48-byte SNTP packet body this client sends and parses. Only the four
/// timestamp fields it actually reads are named; everything else is sent
/// zeroed and ignored on receipt, same as the reference implementation
/// (key identifier / digest fields are not implemented at all).
pub struct NtpPacket {
    pub li_vn_mode: u8,
    pub originate_timestamp: NtpTimestamp,
    pub receive_timestamp: NtpTimestamp,
    pub transmit_timestamp: NtpTimestamp,
}

const PACKET_LEN: usize = 48;

impl NtpPacket {
    fn request(transmit_ts: NtpTimestamp) -> Self {
        NtpPacket {
            li_vn_mode: LI_VN_MODE_CLIENT,
            originate_timestamp: NtpTimestamp::default(),
            receive_timestamp: NtpTimestamp::default(),
            transmit_timestamp: transmit_ts,
        }
    }

    fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0_u8; PACKET_LEN];
        buf[0] = self.li_vn_mode;
        buf[24..28].copy_from_slice(&self.originate_timestamp.seconds.to_be_bytes());
        buf[28..32].copy_from_slice(&self.originate_timestamp.fraction.to_be_bytes());
        buf[32..36].copy_from_slice(&self.receive_timestamp.seconds.to_be_bytes());
        buf[36..40].copy_from_slice(&self.receive_timestamp.fraction.to_be_bytes());
        buf[40..44].copy_from_slice(&self.transmit_timestamp.seconds.to_be_bytes());
        buf[44..48].copy_from_slice(&self.transmit_timestamp.fraction.to_be_bytes());
        buf
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PACKET_LEN {
            return None;
        }
        let read_u32 = |off: usize| u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap());
        Some(NtpPacket {
            li_vn_mode: bytes[0],
            originate_timestamp: NtpTimestamp {
                seconds: read_u32(24),
                fraction: read_u32(28),
            },
            receive_timestamp: NtpTimestamp {
                seconds: read_u32(32),
                fraction: read_u32(36),
            },
            transmit_timestamp: NtpTimestamp {
                seconds: read_u32(40),
                fraction: read_u32(44),
            },
        })
    }
}

/// Whether the clock has ever completed a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NoSync,
    Synchronized,
    Disabled,
}

/// Result of processing one successful round trip: the computed offset and
/// delay (both in milliseconds, clamped the way `process_packet` clamps
/// them), and the new network time.
struct SyncResult {
    network_time: NtpTimestamp,
    offset_ms: i16,
    delay_ms: u16,
}

/// Network-synchronized clock, driven by a [`Clock`] for the monotonic
/// projection between syncs.
pub struct NetworkClock {
    network_time: Cell<NtpTimestamp>,
    base_monotonic_ms: Cell<u64>,
    status: Cell<SyncStatus>,
    last_offset_ms: Cell<i16>,
    last_delay_ms: Cell<u16>,
}

impl NetworkClock {
    pub fn new(enabled: bool) -> Self {
        NetworkClock {
            network_time: Cell::new(NtpTimestamp::unsynced()),
            base_monotonic_ms: Cell::new(0),
            status: Cell::new(if enabled {
                SyncStatus::NoSync
            } else {
                SyncStatus::Disabled
            }),
            last_offset_ms: Cell::new(0),
            last_delay_ms: Cell::new(0),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn last_offset_ms(&self) -> i16 {
        self.last_offset_ms.get()
    }

    pub fn last_delay_ms(&self) -> u16 {
        self.last_delay_ms.get()
    }

    /// Current best estimate of network time, projecting forward from the
    /// last sync using `clock`'s monotonic reading.
    pub fn now(&self, clock: &impl Clock) -> NtpTimestamp {
        if self.status.get() != SyncStatus::Synchronized {
            return self.network_time.get();
        }
        let elapsed_ms = clock.monotonic_ms().saturating_sub(self.base_monotonic_ms.get());
        let elapsed = NtpTimestamp::from_millis(elapsed_ms.min(u32::MAX as u64) as u32);
        NtpTimestamp::from_u64(
            self.network_time
                .get()
                .to_u64()
                .wrapping_add(elapsed.to_u64()),
        )
    }

    fn apply_sync(&self, result: SyncResult, clock: &impl Clock) {
        self.network_time.set(result.network_time);
        self.base_monotonic_ms.set(clock.monotonic_ms());
        self.last_offset_ms.set(result.offset_ms);
        self.last_delay_ms.set(result.delay_ms);
        self.status.set(SyncStatus::Synchronized);
    }
}

/// Compute the round-trip delay and clock offset per RFC 4330 section 8,
/// and clamp them into `i16`/`u16` milliseconds the way `process_packet`
/// does: values whose magnitude would overflow those ranges are reported
/// as zero rather than wrapping.
fn process_packet(packet: &NtpPacket, destination_ts: NtpTimestamp) -> SyncResult {
    let t1 = packet.originate_timestamp.to_u64() as i128;
    let t2 = packet.receive_timestamp.to_u64() as i128;
    let t3 = packet.transmit_timestamp.to_u64() as i128;
    let t4 = destination_ts.to_u64() as i128;

    let delay = (t4 - t1) - (t3 - t2);
    let offset = ((t2 - t1) + (t3 - t4)) / 2;

    let offset_seconds = offset >> 32;
    let offset_ms = if (-32..32).contains(&offset_seconds) {
        (offset_seconds as i64 * 1000 + ((offset & 0xFFFF_FFFF) as i64) % 1000) as i16
    } else {
        0
    };

    let delay_seconds = delay >> 32;
    let delay_ms = if delay_seconds < 64 {
        (delay_seconds as i64 * 1000 + ((delay & 0xFFFF_FFFF) as i64) % 1000).max(0) as u16
    } else {
        0
    };

    let current_time = t1 + delay + offset;
    SyncResult {
        network_time: NtpTimestamp::from_u64(current_time as u64),
        offset_ms,
        delay_ms,
    }
}

/// Run one poll cycle: resolve the server name, send a request, wait for a
/// reply up to [`SNTP_TRIES`] times, and apply the result to `clock` on
/// success. Returns `true` if a sync was applied.
pub async fn sync_once(
    clock: &NetworkClock,
    monotonic_clock: &impl Clock,
    transport: &impl UdpTransport,
    resolver: &impl DnsResolver,
    server_name: &str,
) -> bool {
    let Some(server_ip) = resolver.resolve(server_name).await else {
        return false;
    };
    if server_ip == IpV4Addr::ANY {
        return false;
    }

    for _ in 0..SNTP_TRIES {
        let transmit_ts = clock.now(monotonic_clock);
        let request = NtpPacket::request(transmit_ts);
        if transport
            .send_to((server_ip, SNTP_SERVER_PORT), &request.to_bytes())
            .await
            .is_err()
        {
            return false;
        }

        match tokio::time::timeout(SNTP_TIMEOUT, transport.recv_from()).await {
            Ok(Ok((bytes, _from))) => {
                let destination_ts = clock.now(monotonic_clock);
                if let Some(packet) = NtpPacket::parse(&bytes) {
                    let result = process_packet(&packet, destination_ts);
                    clock.apply_sync(result, monotonic_clock);
                    return true;
                }
            }
            _ => continue,
        }
    }

    false
}

/// Bound a configured poll interval to the RFC-mandated minimum.
pub fn clamp_poll_interval(requested_secs: u32) -> u32 {
    requested_secs.max(SNTP_MINIMUM_POLL_INTERVAL_SECS)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clamp_enforces_rfc_minimum() {
        assert_eq!(clamp_poll_interval(5), SNTP_MINIMUM_POLL_INTERVAL_SECS);
        assert_eq!(clamp_poll_interval(120), 120);
    }

    #[test]
    fn unsynced_sentinel_matches_reference_value() {
        assert_eq!(NtpTimestamp::unsynced().seconds, 0xD000_0000);
    }

    #[test]
    fn process_packet_computes_zero_offset_for_perfectly_aligned_clocks() {
        let t1 = NtpTimestamp::from_millis(1_000_000);
        let packet = NtpPacket {
            li_vn_mode: LI_VN_MODE_CLIENT,
            originate_timestamp: t1,
            receive_timestamp: t1,
            transmit_timestamp: t1,
        };
        let result = process_packet(&packet, t1);
        assert_eq!(result.offset_ms, 0);
        assert_eq!(result.delay_ms, 0);
        assert_eq!(result.network_time, t1);
    }

    #[test]
    fn large_offset_is_reported_as_clamped_zero() {
        let t1 = NtpTimestamp {
            seconds: 0,
            fraction: 0,
        };
        let far_future = NtpTimestamp {
            seconds: 1_000_000_000,
            fraction: 0,
        };
        let packet = NtpPacket {
            li_vn_mode: LI_VN_MODE_CLIENT,
            originate_timestamp: t1,
            receive_timestamp: far_future,
            transmit_timestamp: far_future,
        };
        let result = process_packet(&packet, t1);
        assert_eq!(result.offset_ms, 0);
    }

    #[test]
    fn timestamp_from_millis_round_trips_seconds() {
        let ts = NtpTimestamp::from_millis(2500);
        assert_eq!(ts.seconds, 2);
    }
}
