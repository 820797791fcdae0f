//! An in-process tracing core for services that report to a local collector
//! daemon.
//!
//! The crate builds trees of timed [`Segment`]s, decides per tree whether to
//! keep it (sampling), serializes closed segments into size-bounded JSON
//! documents (streaming), and ships each document as a UDP datagram to a
//! daemon on the same host (emission). Trace identity crosses service
//! boundaries through the `X-Amzn-Trace-Id` header, handled by
//! [`TraceHeader`].
//!
//! # Getting started
//!
//! ```
//! use xray_core::trace::Tracer;
//! use xray_core::Context;
//!
//! let tracer = Tracer::builder()
//!     .with_daemon_address("127.0.0.1:2000")
//!     .build()
//!     .unwrap();
//!
//! let (cx, root) = tracer.begin_segment(&Context::new(), "checkout");
//! let (_cx, call) = tracer.begin_subsegment(&cx, "charge-card");
//! call.add_annotation("amount_cents", 1250);
//! call.close();
//! root.close();
//! ```
//!
//! Sampling and streaming behavior are pluggable through
//! [`sampling::Strategy`] and [`streaming::StreamingStrategy`]; the built-in
//! implementations cover local rule manifests, centrally managed quota rules,
//! whole-tree batching, and bounded per-node streaming.

#![warn(missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
mod context;
pub mod emitter;
mod error;
pub mod sampling;
pub mod streaming;
pub mod trace;
mod util;

pub use config::{ContextMissingStrategy, DaemonEndpoints, Registry, TracerBuilder};
pub use context::{CancelSignal, Context};
pub use error::{Error, Result};
pub use trace::{Segment, TraceHeader, Tracer};
