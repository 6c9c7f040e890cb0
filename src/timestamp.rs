use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::{SystemTime, SystemTimeError};

/// A Unix timestamp in whole seconds since the epoch.
///
/// Used for bid deadlines and session expiry. Carried on the wire as a plain
/// JSON integer; a deadline equal to `now` counts as already expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    pub fn seconds_since_epoch(&self) -> u64 {
        self.0
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

/// A Unix timestamp in milliseconds, as published in vault share quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixMillis(pub i64);

impl UnixMillis {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();
        Ok(Self(now as i64))
    }

    /// Absolute distance from `other`, saturating at `i64::MAX`.
    pub fn skew_from(&self, other: UnixMillis) -> i64 {
        (self.0 - other.0).saturating_abs()
    }
}

impl Display for UnixMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_roundtrip_as_plain_integer() {
        let ts: UnixTimestamp = serde_json::from_str("1699999999").expect("parses");
        assert_eq!(ts, UnixTimestamp(1699999999));
        assert_eq!(serde_json::to_string(&ts).expect("serializes"), "1699999999");
    }

    #[test]
    fn millis_skew_is_symmetric() {
        let a = UnixMillis(1_700_000_000_000);
        let b = UnixMillis(1_700_000_030_000);
        assert_eq!(a.skew_from(b), 30_000);
        assert_eq!(b.skew_from(a), 30_000);
    }
}
