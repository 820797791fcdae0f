//! Streaming strategies: turning a live trace tree into bounded wire
//! documents.
//!
//! A [`StreamingStrategy`] is invoked on every segment close and decides
//! which (if any) documents to hand to the emission client. The built-in set
//! is closed: [`BatchAll`] serializes a whole tree at once when its root
//! closes; [`LimitSubsegment`] ships each node independently and immediately,
//! trading per-node overhead for bounded document size on very wide traces.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::trace::Segment;
use crate::util::{acquire, epoch_seconds};

mod document;

pub use document::Document;

/// Converts a node of a live trace tree into zero or more wire documents.
pub trait StreamingStrategy: Send + Sync + fmt::Debug {
    /// Called when `node` (belonging to the tree rooted at `root`) closes.
    /// May also be called on still-open nodes by strategies that emit
    /// in-progress documents.
    fn stream(&self, node: &Arc<Segment>, root: &Arc<Segment>) -> Vec<Document>;
}

/// Emits the entire tree as one nested document when the root closes.
///
/// Non-root closes produce nothing. All timestamps are derived from the
/// root's wall-clock start plus monotonic offsets, so skew between wall-clock
/// reads cannot produce negative durations. After serialization the live
/// tree's children are detached: ownership of the batched subtree transfers
/// to the document and a later stream of the same root carries no
/// subsegments.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchAll;

impl BatchAll {
    pub fn new() -> Self {
        BatchAll
    }
}

impl StreamingStrategy for BatchAll {
    fn stream(&self, node: &Arc<Segment>, root: &Arc<Segment>) -> Vec<Document> {
        if !Arc::ptr_eq(node, root) {
            return Vec::new();
        }
        let (base, root_mono) = time_base(root);
        let mut document = build_document(root, root, base, root_mono, true);
        decorate_root(&mut document, root);
        vec![document]
    }
}

/// Emits every node independently and immediately, up to a per-tree
/// inclusion limit.
///
/// Each document carries `trace_id`, `parent_id`, and `type = "subsegment"`
/// so the collector can reassemble topology from independently arriving
/// documents. A node streamed before its parent closes is recorded in the
/// parent's precursor list.
#[derive(Clone, Debug)]
pub struct LimitSubsegment {
    limit: usize,
}

impl LimitSubsegment {
    /// Allows up to `limit` subsegment documents per tree; the root's own
    /// document is always emitted.
    pub fn new(limit: usize) -> Self {
        LimitSubsegment { limit }
    }
}

impl Default for LimitSubsegment {
    fn default() -> Self {
        LimitSubsegment::new(20)
    }
}

impl StreamingStrategy for LimitSubsegment {
    fn stream(&self, node: &Arc<Segment>, root: &Arc<Segment>) -> Vec<Document> {
        let (base, root_mono) = time_base(root);

        if Arc::ptr_eq(node, root) {
            let mut document = build_document(root, root, base, root_mono, false);
            decorate_root(&mut document, root);
            return vec![document];
        }

        let Some(root_data) = root.root_data.as_ref() else {
            return Vec::new();
        };
        let streamed = root_data.streamed_subsegments.fetch_add(1, Ordering::Relaxed);
        let emit = streamed < self.limit;

        // Always detach from the parent so the live tree stays bounded; if
        // the document is emitted and the parent is still open, leave a
        // precursor id behind so caused-by ordering survives.
        let mut parent_id = None;
        if let Some(parent) = node.parent.upgrade() {
            parent_id = Some(parent.id().to_string());
            let mut parent_state = acquire(&parent.state);
            parent_state.children.retain(|child| !Arc::ptr_eq(child, node));
            if emit && parent_state.end_mono.is_none() {
                parent_state.precursor_ids.push(node.id());
            }
        }
        if !emit {
            debug!(
                segment = %node.name(),
                limit = self.limit,
                "subsegment inclusion limit reached; document dropped"
            );
            return Vec::new();
        }

        let mut document = build_document(node, root, base, root_mono, false);
        document.trace_id = Some(root_data.trace_id.to_string());
        document.parent_id = parent_id;
        document.kind = Some("subsegment".to_string());
        vec![document]
    }
}

/// The root's wall-clock start (as fractional epoch seconds) and the
/// monotonic instant it corresponds to.
fn time_base(root: &Arc<Segment>) -> (f64, Instant) {
    let state = acquire(&root.state);
    (epoch_seconds(state.start_epoch), state.start_mono)
}

/// Serializes one node; with `nested` the children are drained and serialized
/// recursively, transferring their ownership to the returned document.
/// Locks are taken strictly top-down, one node at a time.
fn build_document(
    node: &Arc<Segment>,
    root: &Arc<Segment>,
    base: f64,
    root_mono: Instant,
    nested: bool,
) -> Document {
    let (mut document, children) = {
        let mut state = acquire(&node.state);
        let children = if nested {
            std::mem::take(&mut state.children)
        } else {
            Vec::new()
        };
        let mut document = Document {
            name: node.name().to_string(),
            id: node.id().to_string(),
            start_time: if Arc::ptr_eq(node, root) {
                base
            } else {
                base + state.start_mono.saturating_duration_since(root_mono).as_secs_f64()
            },
            error: state.error,
            throttle: state.throttle,
            fault: state.fault,
            cause: state.cause.clone(),
            annotations: state.annotations.clone(),
            metadata: state.metadata.clone(),
            namespace: state.namespace.clone(),
            precursor_ids: state.precursor_ids.iter().map(|id| id.to_string()).collect(),
            ..Default::default()
        };
        match state.end_mono {
            Some(end) => {
                document.end_time =
                    Some(base + end.saturating_duration_since(root_mono).as_secs_f64());
            }
            None => document.in_progress = true,
        }
        (document, children)
    };
    document.subsegments = children
        .iter()
        .map(|child| build_document(child, root, base, root_mono, true))
        .collect();
    document
}

/// Stamps root-only fields: trace id, the upstream parent, and the plugin
/// registry's resource metadata, plus the matched sampling rule name.
fn decorate_root(document: &mut Document, root: &Arc<Segment>) {
    let Some(root_data) = root.root_data.as_ref() else {
        return;
    };
    document.trace_id = Some(root_data.trace_id.to_string());
    document.parent_id = root_data.upstream_parent.map(|id| id.to_string());
    document.origin = root_data.registry.origin.clone();
    document.aws = root_data.registry.aws.clone();
    if let Some(rule_name) = &root_data.rule_name {
        document.aws.insert(
            "xray".to_string(),
            serde_json::json!({ "sampling_rule_name": rule_name }),
        );
    }
}
