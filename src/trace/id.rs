use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;

/// Returned when an id string does not have the expected shape.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("malformed {kind} id `{value}`")]
pub struct ParseIdError {
    kind: &'static str,
    value: String,
}

impl ParseIdError {
    fn trace(value: &str) -> Self {
        ParseIdError {
            kind: "trace",
            value: value.to_string(),
        }
    }

    fn segment(value: &str) -> Self {
        ParseIdError {
            kind: "segment",
            value: value.to_string(),
        }
    }
}

/// An X-Ray trace id: `1-<8 hex unix seconds>-<24 hex random>`.
///
/// The epoch component is fixed at generation time from the wall clock; the
/// remaining 96 bits are random. Only the root segment of a tree carries a
/// trace id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId {
    unix_seconds: u32,
    unique: u128, // low 96 bits used
}

impl TraceId {
    /// Generates a fresh trace id stamped with the current wall-clock second.
    pub fn generate() -> Self {
        let unix_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        TraceId {
            unix_seconds,
            unique: rand::rng().random::<u128>() & ((1u128 << 96) - 1),
        }
    }

    /// The unix-seconds component of the id.
    pub fn unix_seconds(&self) -> u32 {
        self.unix_seconds
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1-{:08x}-{:024x}", self.unix_seconds, self.unique)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

impl FromStr for TraceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (version, epoch, unique) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(v), Some(e), Some(u), None) => (v, e, u),
            _ => return Err(ParseIdError::trace(s)),
        };
        if version != "1" || epoch.len() != 8 || unique.len() != 24 {
            return Err(ParseIdError::trace(s));
        }
        Ok(TraceId {
            unix_seconds: u32::from_str_radix(epoch, 16).map_err(|_| ParseIdError::trace(s))?,
            unique: u128::from_str_radix(unique, 16).map_err(|_| ParseIdError::trace(s))?,
        })
    }
}

/// An 8-byte segment id, rendered as 16 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Generates a random segment id.
    pub fn generate() -> Self {
        SegmentId(rand::rng().random::<u64>())
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({self})")
    }
}

impl FromStr for SegmentId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(ParseIdError::segment(s));
        }
        u64::from_str_radix(s, 16)
            .map(SegmentId)
            .map_err(|_| ParseIdError::segment(s))
    }
}
