use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::trace::{SegmentId, TraceId};

const ROOT_KEY: &str = "root";
const PARENT_KEY: &str = "parent";
const SAMPLED_KEY: &str = "sampled";
// Platform-injected noise; discarded on parse and never re-emitted.
const SELF_KEY: &str = "self";

const SAMPLED: &str = "1";
const NOT_SAMPLED: &str = "0";
const REQUESTED: &str = "?";

/// The sampling decision carried by a trace header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SamplingDecision {
    /// The upstream service kept the trace.
    Sampled,
    /// The upstream service dropped the trace.
    NotSampled,
    /// The upstream service asks the downstream to decide and report back.
    Requested,
    /// No decision was communicated.
    #[default]
    Unknown,
}

/// The `X-Amzn-Trace-Id` propagation header, parsed.
///
/// A header is a `;`-separated list of `key=value` pairs. Keys are matched
/// case-insensitively; pair order is irrelevant. `Root`, `Parent`, and
/// `Sampled` are recognized, `Self` is discarded, and anything else is
/// passed through verbatim in [`additional`](Self::additional).
///
/// Parsing is total: malformed fragments are skipped, never fatal.
///
/// ```
/// use xray_core::trace::TraceHeader;
///
/// let header: TraceHeader =
///     "Root=1-5e645f3e-1dfad076a177c5ccc5de12f5;Parent=03babb4ba280be51;Sampled=1"
///         .parse()
///         .unwrap();
/// assert_eq!(
///     header.to_string(),
///     "Root=1-5e645f3e-1dfad076a177c5ccc5de12f5;Parent=03babb4ba280be51;Sampled=1"
/// );
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceHeader {
    /// The trace id of the propagated trace, if present and well formed.
    pub trace_id: Option<TraceId>,
    /// The id of the upstream segment, if present and well formed.
    pub parent_id: Option<SegmentId>,
    /// The propagated sampling decision.
    pub decision: SamplingDecision,
    /// Pass-through pairs, keyed by their verbatim names.
    pub additional: BTreeMap<String, String>,
}

impl TraceHeader {
    /// Parses a header string. Never fails; unrecognizable fragments are
    /// dropped and missing fields stay unset.
    pub fn parse(value: &str) -> Self {
        let mut header = TraceHeader::default();
        for pair in value.split(';') {
            let pair = pair.trim();
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let lowered = key.to_ascii_lowercase();
            match lowered.as_str() {
                ROOT_KEY => header.trace_id = value.to_ascii_lowercase().parse().ok(),
                PARENT_KEY => header.parent_id = value.to_ascii_lowercase().parse().ok(),
                SAMPLED_KEY => match value {
                    SAMPLED => header.decision = SamplingDecision::Sampled,
                    NOT_SAMPLED => header.decision = SamplingDecision::NotSampled,
                    REQUESTED => header.decision = SamplingDecision::Requested,
                    // unrecognized values are ignored, not an override
                    _ => {}
                },
                SELF_KEY => {}
                _ => {
                    header.additional.insert(key.to_string(), value.to_string());
                }
            }
        }
        header
    }
}

impl FromStr for TraceHeader {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TraceHeader::parse(s))
    }
}

impl fmt::Display for TraceHeader {
    /// Serializes as `Root=...;Parent=...;Sampled=...` in that fixed order,
    /// followed by the pass-through pairs sorted ascending by key, with no
    /// trailing separator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::with_capacity(3 + self.additional.len());
        if let Some(trace_id) = &self.trace_id {
            parts.push(format!("Root={trace_id}"));
        }
        if let Some(parent_id) = &self.parent_id {
            parts.push(format!("Parent={parent_id}"));
        }
        match self.decision {
            SamplingDecision::Sampled => parts.push(format!("Sampled={SAMPLED}")),
            SamplingDecision::NotSampled => parts.push(format!("Sampled={NOT_SAMPLED}")),
            SamplingDecision::Requested => parts.push(format!("Sampled={REQUESTED}")),
            SamplingDecision::Unknown => {}
        }
        for (key, value) in &self.additional {
            parts.push(format!("{key}={value}"));
        }
        f.write_str(&parts.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    fn parse_test_data() -> Vec<(&'static str, TraceHeader)> {
        let trace_id: TraceId = "1-5e645f3e-1dfad076a177c5ccc5de12f5".parse().unwrap();
        let parent_id: SegmentId = "03babb4ba280be51".parse().unwrap();
        vec![
            ("", TraceHeader::default()),
            ("garbage-without-equals", TraceHeader::default()),
            ("Root=1-bogus-bad", TraceHeader::default()),
            ("Self=1-5e645f3e-1dfad076a177c5ccc5de12f5", TraceHeader::default()),
            ("Sampled=maybe", TraceHeader::default()),
            ("Sampled=1", TraceHeader { decision: SamplingDecision::Sampled, ..Default::default() }),
            ("Sampled=0", TraceHeader { decision: SamplingDecision::NotSampled, ..Default::default() }),
            ("sAmPlEd=?", TraceHeader { decision: SamplingDecision::Requested, ..Default::default() }),
            ("Root=1-5e645f3e-1dfad076a177c5ccc5de12f5", TraceHeader { trace_id: Some(trace_id), ..Default::default() }),
            ("ROOT=1-5E645F3E-1DFAD076A177C5CCC5DE12F5", TraceHeader { trace_id: Some(trace_id), ..Default::default() }),
            ("Root=1-5e645f3e-1dfad076a177c5ccc5de12f5;Parent=03babb4ba280be51;Sampled=1",
             TraceHeader { trace_id: Some(trace_id), parent_id: Some(parent_id), decision: SamplingDecision::Sampled, ..Default::default() }),
            // pair order is irrelevant
            ("Sampled=1;Parent=03babb4ba280be51;Root=1-5e645f3e-1dfad076a177c5ccc5de12f5",
             TraceHeader { trace_id: Some(trace_id), parent_id: Some(parent_id), decision: SamplingDecision::Sampled, ..Default::default() }),
            ("Root=1-5e645f3e-1dfad076a177c5ccc5de12f5;Self=1-5e645f3e-aaaaaaaaaaaaaaaaaaaaaaaa;Foo=bar",
             TraceHeader { trace_id: Some(trace_id), additional: [("Foo".to_string(), "bar".to_string())].into(), ..Default::default() }),
        ]
    }

    #[test]
    fn parse() {
        for (value, expected) in parse_test_data() {
            assert_eq!(TraceHeader::parse(value), expected, "input {value:?}");
        }
    }

    #[test]
    fn canonical_round_trip() {
        let canonical =
            "Root=1-5e645f3e-1dfad076a177c5ccc5de12f5;Parent=03babb4ba280be51;Sampled=1";
        assert_eq!(TraceHeader::parse(canonical).to_string(), canonical);
    }

    #[test]
    fn additional_data_is_emitted_sorted() {
        let header =
            TraceHeader::parse("Zeta=26;Root=1-5e645f3e-1dfad076a177c5ccc5de12f5;Alpha=1");
        assert_eq!(
            header.to_string(),
            "Root=1-5e645f3e-1dfad076a177c5ccc5de12f5;Alpha=1;Zeta=26"
        );
    }

    #[test]
    fn unrecognized_sampled_value_does_not_override_a_recognized_one() {
        let header = TraceHeader::parse("Sampled=1;Sampled=maybe");
        assert_eq!(header.decision, SamplingDecision::Sampled);
    }

    #[test]
    fn unknown_decision_is_omitted_on_output() {
        let header = TraceHeader::parse("Root=1-5e645f3e-1dfad076a177c5ccc5de12f5");
        assert_eq!(
            header.to_string(),
            "Root=1-5e645f3e-1dfad076a177c5ccc5de12f5"
        );
    }

    #[test]
    fn value_whitespace_and_malformed_fragments_are_skipped() {
        let header = TraceHeader::parse(" Root=1-5e645f3e-1dfad076a177c5ccc5de12f5 ;;notapair; Sampled=0 ");
        assert_eq!(
            header.trace_id.unwrap().to_string(),
            "1-5e645f3e-1dfad076a177c5ccc5de12f5"
        );
        assert_eq!(header.decision, SamplingDecision::NotSampled);
    }
}
