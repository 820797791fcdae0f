use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::sampling::{bernoulli, field_matches, Decision, LocalizedStrategy, Randomizer, Request, Strategy};
use crate::util::{acquire, unix_now};

/// Default interval between remote rule refreshes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Fetches the current centralized rule set from the control endpoint.
///
/// This is the extension point for the remote protocol; the transport
/// (HTTP polling, its endpoints and authentication) is deliberately not part
/// of this crate. A fetch error keeps the previously applied rules in place.
pub trait RuleFetcher: Send + Sync + fmt::Debug {
    fn fetch(&self) -> Result<Vec<RemoteRule>>;
}

/// A centralized sampling rule as delivered by the control endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRule {
    pub rule_name: String,
    pub priority: i64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub http_method: String,
    #[serde(default)]
    pub url_path: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_type: String,
    /// Bernoulli fallback probability once the quota is exhausted.
    pub fixed_rate: f64,
    /// Remote-assigned per-second quota.
    pub reservoir_quota: u64,
    /// Unix-seconds expiry of the quota assignment; 0 means already expired,
    /// which allows only the borrow path.
    pub quota_ttl: u64,
}

/// Per-rule usage counters reported back to the control endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub requests: u64,
    pub sampled: u64,
    pub borrowed: u64,
}

/// A remote-assigned quota with lazy per-second epoch accounting.
///
/// Refreshes that reuse a rule name keep this object alive, so in-flight
/// epoch and usage counters survive rule-metadata changes.
pub(crate) struct CentralizedQuota {
    state: Mutex<QuotaState>,
}

#[derive(Debug)]
struct QuotaState {
    quota: u64,
    ttl: u64,
    fixed_rate: f64,
    current_epoch: u64,
    used: u64,
    requests: u64,
    sampled: u64,
    borrowed: u64,
}

impl CentralizedQuota {
    fn new(quota: u64, ttl: u64, fixed_rate: f64) -> Self {
        CentralizedQuota {
            state: Mutex::new(QuotaState {
                quota,
                ttl,
                fixed_rate,
                current_epoch: 0,
                used: 0,
                requests: 0,
                sampled: 0,
                borrowed: 0,
            }),
        }
    }

    /// Replaces the remote assignment without touching usage counters.
    fn update(&self, quota: u64, ttl: u64, fixed_rate: f64) {
        let mut state = acquire(&self.state);
        state.quota = quota;
        state.ttl = ttl;
        state.fixed_rate = fixed_rate;
    }

    fn sample(&self, randomizer: &Randomizer) -> bool {
        // drawn up front: the randomizer's lock is never taken under ours
        let draw = randomizer.draw();
        self.sample_at(unix_now(), draw)
    }

    /// One refresh-cycle decision. In order: consume unexpired quota; after
    /// expiry, borrow at most one sample per epoch; otherwise Bernoulli
    /// against the fixed rate with strict inequality.
    pub(crate) fn sample_at(&self, now: u64, draw: f64) -> bool {
        let mut state = acquire(&self.state);
        state.requests += 1;
        if state.current_epoch != now {
            state.current_epoch = now;
            state.used = 0;
        }
        if state.ttl > now && state.used < state.quota {
            state.used += 1;
            state.sampled += 1;
            true
        } else if state.ttl <= now && state.used < 1 {
            state.used += 1;
            state.borrowed += 1;
            state.sampled += 1;
            true
        } else if bernoulli(draw, state.fixed_rate) {
            state.sampled += 1;
            true
        } else {
            false
        }
    }

    /// Drains the usage counters for reporting; all reset to zero.
    pub(crate) fn snapshot(&self) -> Statistics {
        let mut state = acquire(&self.state);
        let stats = Statistics {
            requests: state.requests,
            sampled: state.sampled,
            borrowed: state.borrowed,
        };
        state.requests = 0;
        state.sampled = 0;
        state.borrowed = 0;
        stats
    }
}

impl fmt::Debug for CentralizedQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CentralizedQuota")
            .field("state", &*acquire(&self.state))
            .finish()
    }
}

#[derive(Debug)]
struct CentralizedRule {
    name: String,
    priority: i64,
    host: String,
    http_method: String,
    url_path: String,
    service_name: String,
    service_type: String,
    quota: Arc<CentralizedQuota>,
}

impl CentralizedRule {
    fn applies_to(&self, request: &Request<'_>) -> bool {
        field_matches(&self.host, request.host)
            && field_matches(&self.http_method, request.method)
            && field_matches(&self.url_path, request.url_path)
            && field_matches(&self.service_name, request.service_name)
            && field_matches(&self.service_type, request.service_type)
    }
}

type RuleSet = Arc<RwLock<Vec<Arc<CentralizedRule>>>>;

/// A sampling strategy driven by remotely assigned rules and quotas.
///
/// Rules are matched in priority order, ties broken by rule name ascending.
/// While no centralized rules have been applied (or none matches), decisions
/// defer to the wrapped [`LocalizedStrategy`]. A background thread refreshes
/// the rule set through the configured [`RuleFetcher`] and is shut down, best
/// effort, when the strategy is dropped.
#[derive(Debug)]
pub struct CentralizedStrategy {
    rules: RuleSet,
    fallback: LocalizedStrategy,
    randomizer: Randomizer,
    shutdown: Option<SyncSender<()>>,
    poller: Option<thread::JoinHandle<()>>,
}

impl CentralizedStrategy {
    /// Builds a strategy over the built-in default local manifest as
    /// fallback, refreshing through `fetcher` every
    /// [`DEFAULT_POLL_INTERVAL`].
    pub fn new(fetcher: Arc<dyn RuleFetcher>) -> Self {
        Self::with_fallback(fetcher, DEFAULT_POLL_INTERVAL, LocalizedStrategy::default())
    }

    /// Builds a strategy with an explicit localized fallback.
    pub fn with_fallback(
        fetcher: Arc<dyn RuleFetcher>,
        poll_interval: Duration,
        fallback: LocalizedStrategy,
    ) -> Self {
        let rules: RuleSet = Arc::new(RwLock::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = sync_channel(1);
        let worker_rules = Arc::clone(&rules);
        let poller = thread::Builder::new()
            .name("xray-sampling-refresh".to_string())
            .spawn(move || loop {
                match fetcher.fetch() {
                    Ok(remote) => apply_rules(&worker_rules, remote),
                    Err(err) => {
                        warn!(error = %err, "sampling rule refresh failed; keeping previous rules")
                    }
                }
                match shutdown_rx.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        let (shutdown, poller) = match poller {
            Ok(handle) => (Some(shutdown_tx), Some(handle)),
            Err(err) => {
                error!(error = %err, "failed to spawn sampling refresh thread; centralized rules will not update");
                (None, None)
            }
        };
        CentralizedStrategy {
            rules,
            fallback,
            randomizer: Randomizer::new(),
            shutdown,
            poller,
        }
    }

    /// A strategy without a refresh poller; rules change only through
    /// [`apply`](Self::apply). Useful for tests and for callers driving the
    /// refresh cycle themselves.
    pub fn manual(fallback: LocalizedStrategy) -> Self {
        CentralizedStrategy {
            rules: Arc::new(RwLock::new(Vec::new())),
            fallback,
            randomizer: Randomizer::new(),
            shutdown: None,
            poller: None,
        }
    }

    /// Applies a fetched rule set, replacing match criteria wholesale while
    /// preserving the quota object of any rule whose name is reused.
    pub fn apply(&self, remote: Vec<RemoteRule>) {
        apply_rules(&self.rules, remote);
    }

    /// Drains the per-rule usage counters, for reporting back to the control
    /// endpoint. Counters reset to zero.
    pub fn statistics(&self) -> Vec<(String, Statistics)> {
        read_rules(&self.rules)
            .iter()
            .map(|rule| (rule.name.clone(), rule.quota.snapshot()))
            .collect()
    }
}

impl Strategy for CentralizedStrategy {
    fn should_trace(&self, request: &Request<'_>) -> Decision {
        {
            let rules = read_rules(&self.rules);
            for rule in rules.iter() {
                if rule.applies_to(request) {
                    return Decision {
                        sample: rule.quota.sample(&self.randomizer),
                        rule: Some(rule.name.clone()),
                    };
                }
            }
        }
        self.fallback.should_trace(request)
    }
}

impl Drop for CentralizedStrategy {
    fn drop(&mut self) {
        // best effort to stop the refresh thread
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.try_send(());
        }
        // detach the handle; the thread exits on the shutdown signal
        self.poller = None;
    }
}

fn read_rules(rules: &RuleSet) -> std::sync::RwLockReadGuard<'_, Vec<Arc<CentralizedRule>>> {
    rules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn apply_rules(rules: &RuleSet, remote: Vec<RemoteRule>) {
    let previous: HashMap<String, Arc<CentralizedQuota>> = read_rules(rules)
        .iter()
        .map(|rule| (rule.name.clone(), Arc::clone(&rule.quota)))
        .collect();

    let mut next: Vec<Arc<CentralizedRule>> = remote
        .into_iter()
        .map(|rule| {
            let quota = match previous.get(&rule.rule_name) {
                Some(existing) => {
                    existing.update(rule.reservoir_quota, rule.quota_ttl, rule.fixed_rate);
                    Arc::clone(existing)
                }
                None => Arc::new(CentralizedQuota::new(
                    rule.reservoir_quota,
                    rule.quota_ttl,
                    rule.fixed_rate,
                )),
            };
            Arc::new(CentralizedRule {
                name: rule.rule_name,
                priority: rule.priority,
                host: rule.host,
                http_method: rule.http_method,
                url_path: rule.url_path,
                service_name: rule.service_name,
                service_type: rule.service_type,
                quota,
            })
        })
        .collect();
    next.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    debug!(rules = next.len(), "applied centralized sampling rules");
    let mut guard = rules.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::manifest::{Manifest, Rule};

    fn remote_rule(name: &str, priority: i64) -> RemoteRule {
        RemoteRule {
            rule_name: name.into(),
            priority,
            host: "*".into(),
            http_method: "*".into(),
            url_path: "*".into(),
            service_name: String::new(),
            service_type: String::new(),
            fixed_rate: 0.0,
            reservoir_quota: 100,
            quota_ttl: u64::MAX,
        }
    }

    #[test]
    fn quota_consume_then_bernoulli() {
        let now = 1_600_000_000;
        let quota = CentralizedQuota::new(5, now + 10, 0.05);
        for _ in 0..5 {
            assert!(quota.sample_at(now, 0.99));
        }
        // quota exhausted: strict-inequality Bernoulli
        assert!(!quota.sample_at(now, 0.05));
        assert!(quota.sample_at(now, 0.049));
    }

    #[test]
    fn expired_quota_borrows_once_per_epoch() {
        let now = 1_600_000_000;
        let quota = CentralizedQuota::new(5, now - 1, 0.05);
        assert!(quota.sample_at(now, 0.99)); // the one borrow
        assert!(!quota.sample_at(now, 0.99)); // Bernoulli fails
        assert!(quota.sample_at(now, 0.01)); // Bernoulli succeeds
        assert!(quota.sample_at(now + 1, 0.99)); // fresh epoch, fresh borrow
    }

    #[test]
    fn zero_ttl_means_expired() {
        let now = 1_600_000_000;
        let quota = CentralizedQuota::new(5, 0, 0.0);
        assert!(quota.sample_at(now, 0.99));
        assert!(!quota.sample_at(now, 0.99));
    }

    #[test]
    fn snapshot_drains_counters() {
        let now = 1_600_000_000;
        let quota = CentralizedQuota::new(2, now + 10, 0.0);
        assert!(quota.sample_at(now, 0.99));
        assert!(quota.sample_at(now, 0.99));
        assert!(!quota.sample_at(now, 0.99));

        let stats = quota.snapshot();
        assert_eq!(
            stats,
            Statistics {
                requests: 3,
                sampled: 2,
                borrowed: 0
            }
        );
        assert_eq!(quota.snapshot(), Statistics::default());
    }

    #[test]
    fn rules_are_ordered_by_priority_then_name() {
        let strategy = CentralizedStrategy::manual(LocalizedStrategy::default());
        strategy.apply(vec![
            remote_rule("zeta", 1),
            remote_rule("alpha", 1),
            remote_rule("first", 0),
        ]);
        let order: Vec<String> = read_rules(&strategy.rules)
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(order, ["first", "alpha", "zeta"]);
    }

    #[test]
    fn matched_rule_name_is_reported() {
        let strategy = CentralizedStrategy::manual(LocalizedStrategy::default());
        strategy.apply(vec![remote_rule("checkout", 1)]);
        let decision = strategy.should_trace(&Request::default());
        assert!(decision.sample);
        assert_eq!(decision.rule.as_deref(), Some("checkout"));
    }

    #[test]
    fn refresh_preserves_quota_objects_by_name() {
        let now = 1_600_000_000;
        let strategy = CentralizedStrategy::manual(LocalizedStrategy::default());

        let mut rule = remote_rule("checkout", 1);
        rule.reservoir_quota = 5;
        rule.quota_ttl = now + 100;
        strategy.apply(vec![rule.clone()]);

        // consume two units in this epoch
        {
            let rules = read_rules(&strategy.rules);
            assert!(rules[0].quota.sample_at(now, 0.99));
            assert!(rules[0].quota.sample_at(now, 0.99));
        }

        // refresh with changed match criteria but the same name
        rule.url_path = "/checkout/*".into();
        rule.reservoir_quota = 3;
        strategy.apply(vec![rule]);

        let rules = read_rules(&strategy.rules);
        assert_eq!(rules[0].url_path, "/checkout/*");
        // 2 already used out of the updated quota of 3: one grant left
        assert!(rules[0].quota.sample_at(now, 0.99));
        assert!(!rules[0].quota.sample_at(now, 0.99));
        let stats = rules[0].quota.snapshot();
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.sampled, 3);
    }

    #[test]
    fn falls_back_to_localized_when_no_rule_matches() {
        let manifest = Manifest {
            version: 2,
            default_rule: Rule {
                fixed_target: 1_000_000,
                rate: 1.0,
                ..Default::default()
            },
            rules: vec![],
        };
        let fallback = LocalizedStrategy::new(&manifest).unwrap();
        let strategy = CentralizedStrategy::manual(fallback);

        // empty rule set: fallback always samples
        assert!(strategy.should_trace(&Request::default()).sample);

        // a non-matching rule set also falls through
        let mut narrow = remote_rule("narrow", 1);
        narrow.host = "only.this.host".into();
        strategy.apply(vec![narrow]);
        let request = Request {
            host: "different.host",
            ..Default::default()
        };
        let decision = strategy.should_trace(&request);
        assert!(decision.sample);
        assert_eq!(decision.rule, None);
    }

    #[derive(Debug)]
    struct StaticFetcher(Vec<RemoteRule>);

    impl RuleFetcher for StaticFetcher {
        fn fetch(&self) -> crate::error::Result<Vec<RemoteRule>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn poller_applies_the_initial_fetch() {
        let fetcher = Arc::new(StaticFetcher(vec![remote_rule("remote", 1)]));
        let strategy = CentralizedStrategy::with_fallback(
            fetcher,
            Duration::from_secs(3600),
            LocalizedStrategy::default(),
        );
        // the first fetch happens immediately; give the thread a moment
        for _ in 0..100 {
            if !read_rules(&strategy.rules).is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(read_rules(&strategy.rules).len(), 1);
    }
}
