//! Tracer configuration: daemon endpoints, missing-context policy, plugin
//! metadata, and the [`TracerBuilder`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tracing::error;

use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::sampling::{LocalizedStrategy, Strategy};
use crate::streaming::{BatchAll, StreamingStrategy};
use crate::trace::Tracer;

/// Resolved collector daemon endpoints, one per transport.
///
/// Segment documents travel over UDP; centralized sampling-rule traffic is
/// TCP. Both usually point at the same daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonEndpoints {
    pub udp: String,
    pub tcp: String,
}

impl Default for DaemonEndpoints {
    fn default() -> Self {
        DaemonEndpoints {
            udp: "127.0.0.1:2000".to_string(),
            tcp: "127.0.0.1:2000".to_string(),
        }
    }
}

impl FromStr for DaemonEndpoints {
    type Err = Error;

    /// Accepts a plain `host:port` (used for both transports) or two
    /// whitespace-separated `udp:host:port` / `tcp:host:port` tokens in
    /// either order.
    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        match tokens.as_slice() {
            [single] if !single.contains("udp:") && !single.contains("tcp:") => {
                let address = validate_address(single, s)?;
                Ok(DaemonEndpoints {
                    udp: address.clone(),
                    tcp: address,
                })
            }
            [first, second] => {
                let mut udp = None;
                let mut tcp = None;
                for token in [first, second] {
                    if let Some(rest) = token.strip_prefix("udp:") {
                        udp = Some(validate_address(rest, s)?);
                    } else if let Some(rest) = token.strip_prefix("tcp:") {
                        tcp = Some(validate_address(rest, s)?);
                    } else {
                        return Err(Error::InvalidDaemonAddress(s.to_string()));
                    }
                }
                match (udp, tcp) {
                    (Some(udp), Some(tcp)) => Ok(DaemonEndpoints { udp, tcp }),
                    _ => Err(Error::InvalidDaemonAddress(s.to_string())),
                }
            }
            _ => Err(Error::InvalidDaemonAddress(s.to_string())),
        }
    }
}

fn validate_address(address: &str, original: &str) -> Result<String> {
    let invalid = || Error::InvalidDaemonAddress(original.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(address.to_string())
}

/// What `begin_subsegment` does when the context carries no segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContextMissingStrategy {
    /// Log at `error` and continue with a no-op segment.
    #[default]
    LogError,
    /// Silently continue with a no-op segment.
    Ignore,
    /// Panic. For surfacing instrumentation bugs in development.
    Panic,
}

impl ContextMissingStrategy {
    pub(crate) fn handle(&self, operation: &str) {
        match self {
            ContextMissingStrategy::LogError => {
                error!(operation, "no segment found in context");
            }
            ContextMissingStrategy::Ignore => {}
            ContextMissingStrategy::Panic => {
                panic!("{operation}: no segment found in context");
            }
        }
    }
}

/// Resource metadata stamped onto every root document at assembly time.
///
/// Populated explicitly by the host application (for example from an EC2 or
/// ECS metadata probe); the library keeps no process-wide registry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Registry {
    /// The `origin` field of root documents, e.g. `AWS::EC2::Instance`.
    pub origin: Option<String>,
    /// Entries merged into the root document's `aws` object.
    pub aws: BTreeMap<String, Value>,
}

/// Configures and builds a [`Tracer`].
///
/// ```
/// use xray_core::trace::Tracer;
///
/// let tracer = Tracer::builder()
///     .with_daemon_address("127.0.0.1:2000")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct TracerBuilder {
    sampling: Arc<dyn Strategy>,
    streaming: Arc<dyn StreamingStrategy>,
    daemon_address: String,
    context_missing: ContextMissingStrategy,
    registry: Registry,
}

impl Default for TracerBuilder {
    fn default() -> Self {
        TracerBuilder {
            sampling: Arc::new(LocalizedStrategy::default()),
            streaming: Arc::new(BatchAll::new()),
            daemon_address: "127.0.0.1:2000".to_string(),
            context_missing: ContextMissingStrategy::default(),
            registry: Registry::default(),
        }
    }
}

impl TracerBuilder {
    pub fn new() -> Self {
        TracerBuilder::default()
    }

    /// Replaces the sampling strategy consulted for each new trace tree.
    pub fn with_sampling(self, strategy: impl Strategy + 'static) -> Self {
        TracerBuilder {
            sampling: Arc::new(strategy),
            ..self
        }
    }

    /// Replaces the streaming strategy that turns closed segments into
    /// documents.
    pub fn with_streaming(self, strategy: impl StreamingStrategy + 'static) -> Self {
        TracerBuilder {
            streaming: Arc::new(strategy),
            ..self
        }
    }

    /// Sets the daemon address; accepts the formats of
    /// [`DaemonEndpoints::from_str`]. Validated by [`build`](Self::build).
    pub fn with_daemon_address(self, address: impl Into<String>) -> Self {
        TracerBuilder {
            daemon_address: address.into(),
            ..self
        }
    }

    /// Sets the policy applied when `begin_subsegment` finds no segment.
    pub fn with_context_missing(self, strategy: ContextMissingStrategy) -> Self {
        TracerBuilder {
            context_missing: strategy,
            ..self
        }
    }

    /// Sets the resource metadata stamped onto root documents.
    pub fn with_registry(self, registry: Registry) -> Self {
        TracerBuilder { registry, ..self }
    }

    /// Validates the daemon address and builds the tracer.
    pub fn build(self) -> Result<Tracer> {
        let endpoints: DaemonEndpoints = self.daemon_address.parse()?;
        Ok(Tracer::new(
            self.sampling,
            self.streaming,
            Arc::new(Emitter::new(endpoints.udp)),
            self.context_missing,
            self.registry,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_address_fills_both_transports() {
        let endpoints: DaemonEndpoints = "192.168.0.1:2000".parse().unwrap();
        assert_eq!(endpoints.udp, "192.168.0.1:2000");
        assert_eq!(endpoints.tcp, "192.168.0.1:2000");
    }

    #[test]
    fn prefixed_tokens_parse_in_either_order() {
        let a: DaemonEndpoints = "udp:127.0.0.1:2000 tcp:127.0.0.1:2001".parse().unwrap();
        let b: DaemonEndpoints = "tcp:127.0.0.1:2001 udp:127.0.0.1:2000".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.udp, "127.0.0.1:2000");
        assert_eq!(a.tcp, "127.0.0.1:2001");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for input in [
            "",
            "no-port",
            "host:notaport",
            ":2000",
            "host:99999",
            "udp:127.0.0.1:2000",
            "udp:127.0.0.1:2000 udp:127.0.0.1:2001",
            "udp:127.0.0.1:2000 tcp:127.0.0.1:2001 extra:1:2",
        ] {
            assert!(
                matches!(
                    input.parse::<DaemonEndpoints>(),
                    Err(Error::InvalidDaemonAddress(_))
                ),
                "input {input:?} should be rejected"
            );
        }
    }

    #[test]
    fn default_endpoints_target_the_local_daemon() {
        let endpoints = DaemonEndpoints::default();
        assert_eq!(endpoints.udp, "127.0.0.1:2000");
        assert_eq!(endpoints.tcp, "127.0.0.1:2000");
    }

    #[test]
    fn builder_rejects_a_bad_daemon_address() {
        let result = TracerBuilder::new().with_daemon_address("nope").build();
        assert!(matches!(result, Err(Error::InvalidDaemonAddress(_))));
    }

    #[test]
    #[should_panic(expected = "no segment found in context")]
    fn panic_strategy_panics() {
        ContextMissingStrategy::Panic.handle("begin_subsegment");
    }
}
