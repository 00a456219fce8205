//! Heartbeat timestamps: UTC milliseconds as eight big-endian bytes.

use bytes::Bytes;
use std::time::Duration;

pub const HEARTBEAT_LABEL: &str = "heartbeat";
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Clock skew tolerated before a reading is discarded as implausible.
const MIN_PLAUSIBLE_MS: i64 = -1_000;
/// Nothing on this planet takes an hour one-way.
const MAX_PLAUSIBLE_MS: i64 = 3_600_000;

pub fn encode_timestamp(millis: i64) -> Bytes {
    Bytes::copy_from_slice(&millis.to_be_bytes())
}

pub fn decode_timestamp(payload: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

pub fn plausible(latency_ms: i64) -> bool {
    (MIN_PLAUSIBLE_MS..=MAX_PLAUSIBLE_MS).contains(&latency_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let ts = 1_722_500_000_123i64;
        assert_eq!(decode_timestamp(&encode_timestamp(ts)), Some(ts));
        assert_eq!(decode_timestamp(&encode_timestamp(-1)), Some(-1));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(decode_timestamp(&[1, 2, 3]), None);
        assert_eq!(decode_timestamp(&[]), None);
        assert_eq!(decode_timestamp(&[0; 9]), None);
    }

    #[test]
    fn test_plausibility_bounds() {
        assert!(plausible(0));
        assert!(plausible(150));
        assert!(plausible(-500));
        assert!(!plausible(-5_000));
        assert!(!plausible(4_000_000));
    }
}
