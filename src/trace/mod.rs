//! The segment tree API: [`Tracer`], [`Segment`], trace identifiers, and the
//! propagation header codec.

use std::sync::Arc;

use crate::config::{ContextMissingStrategy, Registry, TracerBuilder};
use crate::context::Context;
use crate::emitter::Emitter;
use crate::sampling::{self, Strategy};
use crate::streaming::StreamingStrategy;

mod header;
mod id;
pub(crate) mod segment;

pub use header::{SamplingDecision, TraceHeader};
pub use id::{ParseIdError, SegmentId, TraceId};
pub use segment::{sanitize_name, Cause, ExceptionInfo, Segment};

/// The entry point for starting traces.
///
/// A `Tracer` bundles the sampling strategy, the streaming strategy, the
/// emission client, and the missing-context policy. It is cheap to clone and
/// safe to share across threads.
///
/// ```
/// use xray_core::trace::Tracer;
/// use xray_core::Context;
///
/// let tracer = Tracer::builder().build().unwrap();
/// let (cx, root) = tracer.begin_segment(&Context::new(), "checkout");
/// let (_cx, db) = tracer.begin_subsegment(&cx, "query-inventory");
/// db.close();
/// root.close();
/// ```
#[derive(Clone, Debug)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

#[derive(Debug)]
struct TracerInner {
    sampling: Arc<dyn Strategy>,
    streaming: Arc<dyn StreamingStrategy>,
    emitter: Arc<Emitter>,
    context_missing: ContextMissingStrategy,
    registry: Registry,
}

impl Tracer {
    pub(crate) fn new(
        sampling: Arc<dyn Strategy>,
        streaming: Arc<dyn StreamingStrategy>,
        emitter: Arc<Emitter>,
        context_missing: ContextMissingStrategy,
        registry: Registry,
    ) -> Self {
        Tracer {
            inner: Arc::new(TracerInner {
                sampling,
                streaming,
                emitter,
                context_missing,
                registry,
            }),
        }
    }

    /// A builder with the default configuration.
    pub fn builder() -> TracerBuilder {
        TracerBuilder::new()
    }

    /// Starts a new trace tree with a locally generated trace id, consulting
    /// the sampling strategy with an empty request.
    pub fn begin_segment(&self, cx: &Context, name: &str) -> (Context, Arc<Segment>) {
        self.begin_segment_with_header(cx, name, None, None)
    }

    /// Starts a new trace tree, honoring an inbound propagation header.
    ///
    /// A `Sampled=1` or `Sampled=0` in the header is an upstream decision
    /// and is taken as is; otherwise the sampling strategy decides, matched
    /// against `request` when one is supplied. The header's trace id and
    /// parent id, when present, tie this tree into the upstream trace.
    pub fn begin_segment_with_header(
        &self,
        cx: &Context,
        name: &str,
        header: Option<&TraceHeader>,
        request: Option<&sampling::Request<'_>>,
    ) -> (Context, Arc<Segment>) {
        let trace_id = header
            .and_then(|h| h.trace_id)
            .unwrap_or_else(TraceId::generate);
        let upstream_parent = header.and_then(|h| h.parent_id);
        let additional = header.map(|h| h.additional.clone()).unwrap_or_default();

        let forced = header.and_then(|h| match h.decision {
            SamplingDecision::Sampled => Some(true),
            SamplingDecision::NotSampled => Some(false),
            SamplingDecision::Requested | SamplingDecision::Unknown => None,
        });
        let empty_request = sampling::Request::default();
        let (sampled, rule_name) = match forced {
            Some(sampled) => (sampled, None),
            None => {
                let decision = self
                    .inner
                    .sampling
                    .should_trace(request.unwrap_or(&empty_request));
                (decision.sample, decision.rule)
            }
        };

        let segment = Segment::new_root(
            name,
            trace_id,
            sampled,
            upstream_parent,
            rule_name,
            additional,
            Arc::clone(&self.inner.emitter),
            Arc::clone(&self.inner.streaming),
            self.inner.registry.clone(),
        );
        (cx.with_segment(Arc::clone(&segment)), segment)
    }

    /// Starts a subsegment under the context's current segment.
    ///
    /// With no segment in the context the configured
    /// [`ContextMissingStrategy`] is applied and a no-op segment is returned,
    /// so callers never have to branch on absence.
    pub fn begin_subsegment(&self, cx: &Context, name: &str) -> (Context, Arc<Segment>) {
        let segment = match cx.segment() {
            Some(parent) if !parent.is_noop() => Segment::new_child(parent, name),
            Some(_) => Segment::noop(),
            None => {
                self.inner.context_missing.handle("begin_subsegment");
                Segment::noop()
            }
        };
        (cx.with_segment(Arc::clone(&segment)), segment)
    }
}
