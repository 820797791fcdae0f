//! Sampling strategies: keep/drop decision logic for new trace trees.
//!
//! A [`Strategy`] is consulted once per root segment. The built-in set is
//! closed: [`AllStrategy`] keeps everything, [`LocalizedStrategy`] applies a
//! local rule manifest, and [`CentralizedStrategy`] applies remotely assigned
//! rules with per-rule quotas, falling back to a localized strategy.

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::util::acquire;

mod centralized;
mod local;
pub mod manifest;
pub mod reservoir;
pub mod wildcard;

pub use centralized::{
    CentralizedStrategy, RemoteRule, RuleFetcher, Statistics, DEFAULT_POLL_INTERVAL,
};
pub use local::LocalizedStrategy;
pub use manifest::{Manifest, Rule};
pub use reservoir::Reservoir;
pub use wildcard::wildcard_match;

/// The facts about an incoming request a strategy may match on.
///
/// An empty field is treated as "always matches", never as "never matches":
/// a scheduled task with no HTTP attributes still gets a decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct Request<'a> {
    pub host: &'a str,
    pub method: &'a str,
    pub url_path: &'a str,
    pub service_name: &'a str,
    pub service_type: &'a str,
}

/// The outcome of a sampling consultation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Whether to keep the trace.
    pub sample: bool,
    /// The name of the centralized rule that matched, if any.
    pub rule: Option<String>,
}

/// A keep/drop decision maker for new trace trees.
pub trait Strategy: Send + Sync + fmt::Debug {
    /// Decides whether a trace for the given request should be kept.
    fn should_trace(&self, request: &Request<'_>) -> Decision;
}

/// Samples every trace. Used by tests and disabled configurations.
#[derive(Clone, Debug, Default)]
pub struct AllStrategy;

impl Strategy for AllStrategy {
    fn should_trace(&self, _request: &Request<'_>) -> Decision {
        Decision {
            sample: true,
            rule: None,
        }
    }
}

/// Rule-pattern matching: an empty request field always matches, an empty
/// pattern is an implicit `*`, everything else is a case-insensitive glob.
pub(crate) fn field_matches(pattern: &str, value: &str) -> bool {
    value.is_empty() || pattern.is_empty() || wildcard_match(pattern, value, true)
}

/// The strict-inequality Bernoulli rule shared by all strategies: a draw
/// equal to the rate is NOT sampled.
pub(crate) fn bernoulli(draw: f64, rate: f64) -> bool {
    draw < rate
}

/// A lazily seeded random source, one per strategy or quota instance.
///
/// Seeded from the OS entropy source on first use; if that is unavailable,
/// falls back to a timestamp-derived seed. Tests bypass it through the
/// `*_at` seams that accept an explicit draw.
pub(crate) struct Randomizer {
    rng: Mutex<Option<SmallRng>>,
}

impl Randomizer {
    pub(crate) fn new() -> Self {
        Randomizer {
            rng: Mutex::new(None),
        }
    }

    /// A uniform draw in `[0, 1)`.
    pub(crate) fn draw(&self) -> f64 {
        let mut guard = acquire(&self.rng);
        let rng = guard.get_or_insert_with(seeded_rng);
        rng.random::<f64>()
    }
}

impl fmt::Debug for Randomizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Randomizer")
            .field("seeded", &acquire(&self.rng).is_some())
            .finish()
    }
}

fn seeded_rng() -> SmallRng {
    SmallRng::try_from_os_rng().unwrap_or_else(|_| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        SmallRng::seed_from_u64(seed)
    })
}
