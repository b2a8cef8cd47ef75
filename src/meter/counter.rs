//! Traffic counters with wrap correction.
//!
//! Kernel interface counters are sampled as 32-bit values on some drivers
//! and silently wrap at 4 GiB. Persisted counters are kept "wrap corrected"
//! (monotonic 64-bit) by feeding each fresh sample through
//! [`unwrap_counter`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Width of sampled counters.
pub const COUNTER_WIDTH: u32 = 32;

/// Correct a sampled counter against the previous corrected value.
///
/// Uses the default 32-bit width.
pub fn unwrap_counter(old_corrected: u64, new_sampled: u64) -> u64 {
    unwrap_counter_width(old_corrected, new_sampled, COUNTER_WIDTH)
}

/// Correct a sampled counter of the given bit width.
///
/// The low `width` bits of both values are compared. A negative difference
/// of at least half the counter range is taken as a wrap and corrected by
/// adding `2^width`; smaller negative differences are accepted as they are
/// (counter reset or sampling glitch). A sample that does not fit in `width`
/// bits is returned unchanged.
pub fn unwrap_counter_width(old_corrected: u64, new_sampled: u64, width: u32) -> u64 {
    let modulus: i128 = 1i128 << width;
    let threshold: i128 = 1i128 << (width - 1);
    let new = i128::from(new_sampled);

    if new > modulus {
        warn!(sample = new_sampled, width, "counter sample wider than expected, using as is");
        return new_sampled;
    }

    let old = i128::from(old_corrected);
    let mut diff = new % modulus - old % modulus;
    if diff < 0 && -diff >= threshold {
        diff += modulus;
    }

    u64::try_from(old + diff).unwrap_or(0)
}

/// Counters and rates for one traffic direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCounters {
    /// Wrap corrected byte count.
    pub bytes: u64,
    /// Wrap corrected packet count.
    pub packets: u64,
    /// Last time the corrected counters changed.
    pub last_change_at: DateTime<Utc>,
    /// Bytes per second over the last change.
    pub rate_current: f64,
    /// Highest `rate_current` seen.
    pub rate_maximum: f64,
}

impl TrafficCounters {
    /// Fresh counters, considered changed at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            bytes: 0,
            packets: 0,
            last_change_at: now,
            rate_current: 0.0,
            rate_maximum: 0.0,
        }
    }

    /// Fold a session device sample into the counters.
    ///
    /// `last_change_at` only moves when a corrected value changed, so it
    /// doubles as the idle detector. The current rate covers the span from
    /// the previous change to now; an unchanged sample yields rate zero.
    /// A `None` field could not be read this round and stays untouched.
    ///
    /// Returns whether anything changed.
    pub fn observe(&mut self, bytes: Option<u64>, packets: Option<u64>, now: DateTime<Utc>) -> bool {
        let old_bytes = self.bytes;
        let old_packets = self.packets;

        if let Some(sample) = bytes {
            self.bytes = unwrap_counter(old_bytes, sample);
        }
        if let Some(sample) = packets {
            self.packets = unwrap_counter(old_packets, sample);
        }

        let changed = self.bytes != old_bytes || self.packets != old_packets;
        if changed {
            let rate = byte_rate(old_bytes, self.bytes, self.last_change_at, now);
            self.last_change_at = now;
            self.set_rate(rate);
        } else {
            self.set_rate(0.0);
        }
        changed
    }

    /// Fold a link sample into the counters.
    ///
    /// Links are sampled every round regardless of traffic, so the rate is
    /// taken over the interval since the previous sample and the change
    /// time always advances.
    pub fn observe_interval(&mut self, bytes: Option<u64>, packets: Option<u64>, now: DateTime<Utc>) {
        let old_bytes = self.bytes;
        if let Some(sample) = bytes {
            self.bytes = unwrap_counter(old_bytes, sample);
        }
        if let Some(sample) = packets {
            self.packets = unwrap_counter(self.packets, sample);
        }
        let rate = byte_rate(old_bytes, self.bytes, self.last_change_at, now);
        self.last_change_at = now;
        self.set_rate(rate);
    }

    fn set_rate(&mut self, rate: f64) {
        self.rate_current = rate;
        if rate > self.rate_maximum {
            self.rate_maximum = rate;
        }
    }
}

/// Bytes per second between two samples; zero for an empty or negative span.
pub fn byte_rate(old_bytes: u64, new_bytes: u64, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let secs = (to - from).num_milliseconds() as f64 / 1000.0;
    if secs <= 0.0 {
        return 0.0;
    }
    (new_bytes as f64 - old_bytes as f64) / secs
}
