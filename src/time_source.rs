//! Periodic publisher that pushes the gateway's NTP-disciplined time onto
//! the wireless mesh so nodes can discipline their own clocks against it.
//!
//! Grounded on `time_source.c`: a free-running 8-bit sequence counter,
//! incremented once per tick, travels alongside the timestamp so receivers
//! can detect lost or reordered publications.

use crate::net::{Clock, WirelessPort};
use crate::sntp::NetworkClock;
use std::cell::Cell;
use std::time::Duration;

/// Interval between publications. Not specified by the option this
/// gateway exposes for whether the publisher runs at all
/// ([`crate::config::ConfigKey::EnableTimeSource`]); a 1-second cadence
/// matches the granularity the mesh's clock-sync subsystem expects.
pub const TIME_SOURCE_DELAY: Duration = Duration::from_millis(1000);

/// Publishes NTP time to the mesh on a fixed interval, maintaining the
/// wrapping sequence counter between calls.
pub struct TimeSourcePublisher {
    sequence: Cell<u8>,
}

impl TimeSourcePublisher {
    pub fn new() -> Self {
        TimeSourcePublisher {
            sequence: Cell::new(0),
        }
    }

    /// Advance the sequence counter and publish one sample. `short_addr` is
    /// this gateway's own mesh address, broadcast to all nodes.
    pub async fn publish_once(
        &self,
        wireless: &impl WirelessPort,
        clock: &impl Clock,
        network_clock: &NetworkClock,
        short_addr: u16,
    ) -> std::io::Result<()> {
        self.sequence.set(self.sequence.get().wrapping_add(1));
        let local_us = clock.wall_clock_us();
        let ntp_now_us = network_clock.now(clock).to_unix_micros();
        wireless
            .publish_time(short_addr, self.sequence.get(), local_us, ntp_now_us)
            .await
    }

    /// Run forever, publishing once per [`TIME_SOURCE_DELAY`].
    pub async fn run(
        &self,
        wireless: &impl WirelessPort,
        clock: &impl Clock,
        network_clock: &NetworkClock,
        short_addr: u16,
    ) {
        loop {
            if let Err(e) = self
                .publish_once(wireless, clock, network_clock, short_addr)
                .await
            {
                log::warn!("time source publish failed: {e}");
            }
            tokio::time::sleep(TIME_SOURCE_DELAY).await;
        }
    }
}

impl Default for TimeSourcePublisher {
    fn default() -> Self {
        Self::new()
    }
}
