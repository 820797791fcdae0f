use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::Registry;
use crate::emitter::Emitter;
use crate::streaming::StreamingStrategy;
use crate::trace::{SamplingDecision, SegmentId, TraceHeader, TraceId};
use crate::util::acquire;

/// Maximum segment name length after sanitization.
const MAX_NAME_LEN: usize = 200;

/// Filters a segment name down to the allowed alphabet (letters, digits,
/// separators, and `_ . : / % & # = + - @`) and truncates it to 200
/// characters. Total and idempotent.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|&c| {
            c.is_alphanumeric()
                || is_separator(c)
                || matches!(c, '_' | '.' | ':' | '/' | '%' | '&' | '#' | '=' | '+' | '-' | '@')
        })
        .take(MAX_NAME_LEN)
        .collect()
}

/// Unicode category Z only. `char::is_whitespace` is the wider White_Space
/// property, which also admits control characters (tab, LF, VT, FF, CR,
/// NEL); those must not reach the wire document.
fn is_separator(c: char) -> bool {
    c.is_whitespace() && !matches!(c, '\t' | '\n' | '\x0b' | '\x0c' | '\r' | '\u{85}')
}

/// A named, timed unit of work within a trace tree.
///
/// Segments are shared as `Arc<Segment>` between the goroutine-equivalent
/// that created them and any tasks the owning context was propagated to, so
/// every node guards its mutable fields behind its own mutex. A parent's
/// lock is never held while a child's is acquired.
///
/// The root node owns the tree: it holds the trace id, the sampling
/// decision (fixed for the tree's lifetime), and the emission handles.
/// Children keep non-owning back-references to their parent and root.
pub struct Segment {
    pub(crate) id: SegmentId,
    pub(crate) name: String,
    pub(crate) parent: Weak<Segment>,
    pub(crate) root: Weak<Segment>,
    /// Present on root nodes only.
    pub(crate) root_data: Option<RootData>,
    /// No-op segments absorb all operations; see [`Segment::noop`].
    pub(crate) noop: bool,
    pub(crate) state: Mutex<SegmentState>,
}

pub(crate) struct RootData {
    pub(crate) trace_id: TraceId,
    pub(crate) sampled: bool,
    pub(crate) upstream_parent: Option<SegmentId>,
    /// Name of the centralized sampling rule that matched, if any.
    pub(crate) rule_name: Option<String>,
    /// Pass-through pairs from the inbound trace header, re-emitted downstream.
    pub(crate) additional: BTreeMap<String, String>,
    pub(crate) emitter: Arc<Emitter>,
    pub(crate) streaming: Arc<dyn StreamingStrategy>,
    pub(crate) registry: Registry,
    /// Subsegment documents already emitted for this tree; used by streaming
    /// strategies that enforce a per-tree inclusion limit.
    pub(crate) streamed_subsegments: AtomicUsize,
}

pub(crate) struct SegmentState {
    pub(crate) start_epoch: SystemTime,
    pub(crate) start_mono: Instant,
    /// Set exactly once by `close`. Wall-clock end times are derived from
    /// this offset so clock skew cannot produce negative durations.
    pub(crate) end_mono: Option<Instant>,
    pub(crate) error: bool,
    pub(crate) throttle: bool,
    pub(crate) fault: bool,
    pub(crate) cause: Option<Cause>,
    pub(crate) annotations: BTreeMap<String, Value>,
    pub(crate) metadata: BTreeMap<String, BTreeMap<String, Value>>,
    pub(crate) namespace: Option<String>,
    /// Append-only while the node is open; drained by the streaming strategy
    /// when ownership of the batched subtree transfers to a document.
    pub(crate) children: Vec<Arc<Segment>>,
    /// Ids of children that were streamed out before this node closed, so
    /// the collector can still compute caused-by ordering.
    pub(crate) precursor_ids: Vec<SegmentId>,
}

impl SegmentState {
    fn open_now() -> Self {
        SegmentState {
            start_epoch: SystemTime::now(),
            start_mono: Instant::now(),
            end_mono: None,
            error: false,
            throttle: false,
            fault: false,
            cause: None,
            annotations: BTreeMap::new(),
            metadata: BTreeMap::new(),
            namespace: None,
            children: Vec::new(),
            precursor_ids: Vec::new(),
        }
    }
}

impl Segment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_root(
        name: &str,
        trace_id: TraceId,
        sampled: bool,
        upstream_parent: Option<SegmentId>,
        rule_name: Option<String>,
        additional: BTreeMap<String, String>,
        emitter: Arc<Emitter>,
        streaming: Arc<dyn StreamingStrategy>,
        registry: Registry,
    ) -> Arc<Segment> {
        Arc::new_cyclic(|me| Segment {
            id: SegmentId::generate(),
            name: sanitize_name(name),
            parent: Weak::new(),
            root: me.clone(),
            root_data: Some(RootData {
                trace_id,
                sampled,
                upstream_parent,
                rule_name,
                additional,
                emitter,
                streaming,
                registry,
                streamed_subsegments: AtomicUsize::new(0),
            }),
            noop: false,
            state: Mutex::new(SegmentState::open_now()),
        })
    }

    pub(crate) fn new_child(parent: &Arc<Segment>, name: &str) -> Arc<Segment> {
        let child = Arc::new(Segment {
            id: SegmentId::generate(),
            name: sanitize_name(name),
            parent: Arc::downgrade(parent),
            root: if parent.is_root() {
                Arc::downgrade(parent)
            } else {
                parent.root.clone()
            },
            root_data: None,
            noop: false,
            state: Mutex::new(SegmentState::open_now()),
        });
        acquire(&parent.state).children.push(Arc::clone(&child));
        child
    }

    /// A segment that absorbs every operation and never emits.
    ///
    /// Returned by `begin_subsegment` when no segment is present in the
    /// context, so instrumentation adapters are never handed a null.
    pub fn noop() -> Arc<Segment> {
        Arc::new(Segment {
            id: SegmentId::generate(),
            name: String::new(),
            parent: Weak::new(),
            root: Weak::new(),
            root_data: None,
            noop: true,
            state: Mutex::new(SegmentState::open_now()),
        })
    }

    /// The segment's id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// The sanitized segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this node is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.root_data.is_some()
    }

    /// Whether this segment is a no-op placeholder.
    pub fn is_noop(&self) -> bool {
        self.noop
    }

    /// The trace id held by this tree's root, if the root is still alive.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.with_root_data(|data| data.trace_id)
    }

    /// The sampling decision for the whole tree. Identical for every node.
    pub fn is_sampled(&self) -> bool {
        self.with_root_data(|data| data.sampled).unwrap_or(false)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        acquire(&self.state).end_mono.is_some()
    }

    fn with_root_data<T>(&self, f: impl FnOnce(&RootData) -> T) -> Option<T> {
        if let Some(data) = self.root_data.as_ref() {
            return Some(f(data));
        }
        self.root.upgrade().and_then(|root| root.root_data.as_ref().map(f))
    }

    pub(crate) fn root_arc(self: &Arc<Self>) -> Option<Arc<Segment>> {
        if self.is_root() {
            Some(Arc::clone(self))
        } else {
            self.root.upgrade()
        }
    }

    /// Closes the segment, recording its end time, and forwards whatever the
    /// tree's streaming strategy produces to the emission client.
    ///
    /// Closing a segment twice is a caller error; the second call is a
    /// logged no-op.
    pub fn close(self: &Arc<Self>) {
        if self.noop {
            return;
        }
        {
            let mut state = acquire(&self.state);
            if state.end_mono.is_some() {
                debug!(segment = %self.name, id = %self.id, "close called on an already closed segment");
                return;
            }
            state.end_mono = Some(Instant::now());
        }
        self.flush();
    }

    /// Runs the streaming strategy for this node and emits its output.
    /// All segment locks are released before any datagram is written.
    fn flush(self: &Arc<Self>) {
        let Some(root) = self.root_arc() else {
            return;
        };
        let Some(root_data) = root.root_data.as_ref() else {
            return;
        };
        if !root_data.sampled {
            return;
        }
        let documents = root_data.streaming.stream(self, &root);
        for document in &documents {
            root_data.emitter.emit(document);
        }
    }

    /// Records an error on the segment: sets the `fault` flag and appends a
    /// cause entry carrying the error's message.
    pub fn add_error(&self, err: &dyn std::error::Error) {
        if self.noop {
            return;
        }
        let mut state = acquire(&self.state);
        state.fault = true;
        state
            .cause
            .get_or_insert_with(Cause::default)
            .exceptions
            .push(ExceptionInfo::from_error(err));
    }

    /// Records a throttling response: sets `throttle` together with `error`.
    pub fn add_throttle(&self) {
        if self.noop {
            return;
        }
        let mut state = acquire(&self.state);
        state.throttle = true;
        state.error = true;
    }

    /// Sets the `error` flag. Classification is supplied by adapters.
    pub fn set_error(&self, error: bool) {
        if !self.noop {
            acquire(&self.state).error = error;
        }
    }

    /// Sets the `fault` flag. Classification is supplied by adapters.
    pub fn set_fault(&self, fault: bool) {
        if !self.noop {
            acquire(&self.state).fault = fault;
        }
    }

    /// Sets the `throttle` flag. Classification is supplied by adapters.
    pub fn set_throttle(&self, throttle: bool) {
        if !self.noop {
            acquire(&self.state).throttle = throttle;
        }
    }

    /// Records an indexed annotation.
    pub fn add_annotation(&self, key: impl Into<String>, value: impl Into<Value>) {
        if !self.noop {
            acquire(&self.state).annotations.insert(key.into(), value.into());
        }
    }

    /// Records free-form metadata under the `default` namespace.
    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.add_metadata_to_namespace("default", key, value);
    }

    /// Records free-form metadata under an explicit namespace.
    pub fn add_metadata_to_namespace(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        if self.noop {
            return;
        }
        acquire(&self.state)
            .metadata
            .entry(namespace.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Sets the segment namespace, e.g. `aws` or `remote`.
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        if !self.noop {
            acquire(&self.state).namespace = Some(namespace.into());
        }
    }

    /// Builds the trace header to propagate to a downstream service: this
    /// segment as `Parent`, the tree's trace id as `Root`, the tree's
    /// sampling decision, and any pass-through pairs from the inbound header.
    pub fn downstream_header(&self) -> TraceHeader {
        let mut header = TraceHeader {
            parent_id: Some(self.id),
            ..Default::default()
        };
        let root_view =
            self.with_root_data(|data| (data.trace_id, data.sampled, data.additional.clone()));
        if let Some((trace_id, sampled, additional)) = root_view {
            header.trace_id = Some(trace_id);
            header.decision = decision_from(sampled);
            header.additional = additional;
        }
        header
    }
}

fn decision_from(sampled: bool) -> SamplingDecision {
    if sampled {
        SamplingDecision::Sampled
    } else {
        SamplingDecision::NotSampled
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("root", &self.is_root())
            .field("noop", &self.noop)
            .finish()
    }
}

/// Structured exception information attached to a segment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<ExceptionInfo>,
}

/// A single recorded exception.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "crate::util::is_false")]
    pub remote: bool,
}

impl ExceptionInfo {
    fn from_error(err: &dyn std::error::Error) -> Self {
        ExceptionInfo {
            id: SegmentId::generate().to_string(),
            message: err.to_string(),
            kind: "error".to_string(),
            remote: false,
        }
    }
}

/// Builds a standalone root wired to a disconnected emitter, for tests that
/// need a live tree without a tracer.
#[cfg(test)]
pub(crate) fn test_root(sampled: bool) -> Arc<Segment> {
    Segment::new_root(
        "test",
        TraceId::generate(),
        sampled,
        None,
        None,
        BTreeMap::new(),
        Arc::new(Emitter::disconnected()),
        Arc::new(crate::streaming::BatchAll::new()),
        Registry::default(),
    )
}
