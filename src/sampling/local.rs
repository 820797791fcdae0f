use crate::error::Result;
use crate::sampling::manifest::{Manifest, Rule};
use crate::sampling::reservoir::Reservoir;
use crate::sampling::{bernoulli, field_matches, Decision, Randomizer, Request, Strategy};
use crate::util::unix_now;

/// A sampling strategy driven by a local rule manifest.
///
/// Rules are scanned in declared order and the first match wins; there is no
/// priority sorting. A matched rule keeps the trace deterministically while
/// its per-second reservoir has spare capacity, then falls back to an
/// independent Bernoulli draw against the rule's rate.
#[derive(Debug)]
pub struct LocalizedStrategy {
    rules: Vec<LocalRule>,
    default_rule: LocalRule,
    randomizer: Randomizer,
}

#[derive(Debug)]
struct LocalRule {
    rule: Rule,
    reservoir: Reservoir,
}

impl LocalRule {
    fn new(rule: Rule) -> Self {
        let reservoir = Reservoir::new(rule.fixed_target);
        LocalRule { rule, reservoir }
    }

    fn applies_to(&self, request: &Request<'_>) -> bool {
        field_matches(&self.rule.host, request.host)
            && field_matches(&self.rule.http_method, request.method)
            && field_matches(&self.rule.url_path, request.url_path)
    }

    fn sample(&self, randomizer: &Randomizer) -> bool {
        self.sample_at(unix_now(), randomizer.draw())
    }

    fn sample_at(&self, now: u64, draw: f64) -> bool {
        if self.reservoir.take_at(now) {
            return true;
        }
        bernoulli(draw, self.rule.rate)
    }
}

impl LocalizedStrategy {
    /// Validates the manifest and builds a strategy over a normalized deep
    /// copy of it, with one reservoir per rule plus a default reservoir.
    pub fn new(manifest: &Manifest) -> Result<Self> {
        manifest.validate()?;
        Ok(Self::from_normalized(manifest.normalized()))
    }

    fn from_normalized(manifest: Manifest) -> Self {
        LocalizedStrategy {
            rules: manifest.rules.into_iter().map(LocalRule::new).collect(),
            default_rule: LocalRule::new(manifest.default_rule),
            randomizer: Randomizer::new(),
        }
    }
}

impl Default for LocalizedStrategy {
    /// A strategy over the built-in default manifest: one trace per second
    /// plus five percent of the remainder.
    fn default() -> Self {
        Self::from_normalized(Manifest::default().normalized())
    }
}

impl Strategy for LocalizedStrategy {
    fn should_trace(&self, request: &Request<'_>) -> Decision {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.applies_to(request))
            .unwrap_or(&self.default_rule);
        Decision {
            sample: rule.sample(&self.randomizer),
            rule: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn manifest_with_rules(rules: Vec<Rule>) -> Manifest {
        Manifest {
            version: 2,
            default_rule: Rule {
                fixed_target: 0,
                rate: 0.0,
                ..Default::default()
            },
            rules,
        }
    }

    fn rule(host: &str, path: &str, fixed_target: u64, rate: f64) -> Rule {
        Rule {
            host: host.into(),
            http_method: "*".into(),
            url_path: path.into(),
            fixed_target,
            rate,
            ..Default::default()
        }
    }

    #[test]
    fn construction_fails_fast_on_an_invalid_manifest() {
        let manifest = Manifest {
            version: 7,
            default_rule: Rule::default(),
            rules: vec![],
        };
        assert!(matches!(
            LocalizedStrategy::new(&manifest),
            Err(Error::UnsupportedManifestVersion(7))
        ));
    }

    #[test]
    fn first_matching_rule_wins_in_declared_order() {
        // both rules match the request; the first has capacity, the second
        // would never sample
        let manifest = manifest_with_rules(vec![
            rule("*", "/api/*", 1_000_000, 1.0),
            rule("*", "*", 0, 0.0),
        ]);
        let strategy = LocalizedStrategy::new(&manifest).unwrap();
        let request = Request {
            host: "svc.internal",
            url_path: "/api/users",
            ..Default::default()
        };
        for _ in 0..100 {
            assert!(strategy.should_trace(&request).sample);
        }
    }

    #[test]
    fn no_match_defers_to_the_default_rule() {
        let manifest = manifest_with_rules(vec![rule("other.host", "/nope", 1_000_000, 1.0)]);
        let strategy = LocalizedStrategy::new(&manifest).unwrap();
        // default rule has no reservoir and rate zero
        let request = Request {
            host: "svc.internal",
            url_path: "/api/users",
            ..Default::default()
        };
        for _ in 0..100 {
            assert!(!strategy.should_trace(&request).sample);
        }
    }

    #[test]
    fn reservoir_then_bernoulli_with_strict_inequality() {
        let local = LocalRule::new(rule("*", "*", 2, 0.05));
        let epoch = 1_600_000_000;
        assert!(local.sample_at(epoch, 0.99)); // reservoir
        assert!(local.sample_at(epoch, 0.99)); // reservoir
        assert!(!local.sample_at(epoch, 0.05)); // draw == rate is not sampled
        assert!(local.sample_at(epoch, 0.049)); // draw < rate is sampled
        assert!(local.sample_at(epoch + 1, 0.99)); // fresh epoch, reservoir again
    }

    #[test]
    fn empty_request_matches_the_first_rule() {
        let manifest = manifest_with_rules(vec![rule("specific.host", "/specific", 1_000_000, 1.0)]);
        let strategy = LocalizedStrategy::new(&manifest).unwrap();
        // all-empty request fields are wildcards and match the first rule
        assert!(strategy.should_trace(&Request::default()).sample);
    }
}
