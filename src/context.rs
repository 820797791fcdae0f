use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::trace::Segment;

/// An execution-scoped collection of values.
///
/// A [`Context`] carries the current segment (and any other ambient values,
/// such as a request-scoped logger) across API boundaries. Contexts are
/// immutable: write operations return a new context containing the original
/// values plus the new one, so a context handed to a nested operation can
/// never be mutated behind the caller's back.
///
/// There is no implicit "current" context; every API that needs ambient
/// segment access takes a `&Context` explicitly.
///
/// # Examples
///
/// ```
/// use xray_core::Context;
///
/// #[derive(Debug, PartialEq)]
/// struct RequestId(u64);
///
/// let cx = Context::new().with_value(RequestId(7));
/// assert_eq!(cx.get::<RequestId>(), Some(&RequestId(7)));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    segment: Option<Arc<Segment>>,
    cancel: Option<CancelSignal>,
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>, BuildHasherDefault<IdHasher>>,
}

impl Context {
    /// Creates an empty `Context`.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a clone of this context with the given value set.
    ///
    /// Values are keyed by type; setting a value of an already-present type
    /// replaces it. Use application-specific newtypes to avoid collisions.
    pub fn with_value<T: Send + Sync + 'static>(&self, value: T) -> Self {
        let mut new_context = self.clone();
        new_context
            .entries
            .insert(TypeId::of::<T>(), Arc::new(value));
        new_context
    }

    /// Returns a reference to the value of type `T`, if one is set.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|rc| rc.downcast_ref())
    }

    /// Returns a clone of this context with the given segment as current.
    pub fn with_segment(&self, segment: Arc<Segment>) -> Self {
        let mut new_context = self.clone();
        new_context.segment = Some(segment);
        new_context
    }

    /// Returns the current segment, if any.
    pub fn segment(&self) -> Option<&Arc<Segment>> {
        self.segment.as_ref()
    }

    /// Returns a clone of this context carrying the given cancellation signal.
    pub fn with_cancel(&self, cancel: CancelSignal) -> Self {
        let mut new_context = self.clone();
        new_context.cancel = Some(cancel);
        new_context
    }

    /// Whether the context's cancellation signal, if any, has fired.
    pub fn is_done(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled)
    }

    /// Returns a context insulated from this one's cancellation signal.
    ///
    /// Background work that must outlive its parent request detaches by
    /// rebinding the current segment and all other values into a context
    /// that never reports done. Everything except the cancellation signal
    /// is preserved.
    pub fn detached(&self) -> Self {
        let mut new_context = self.clone();
        new_context.cancel = None;
        new_context
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("has_segment", &self.segment.is_some())
            .field("has_cancel", &self.cancel.is_some())
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A shareable one-shot cancellation flag.
///
/// Cloning yields another handle to the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        CancelSignal::default()
    }

    /// Fires the signal. All contexts carrying it report done afterwards.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// With `TypeId`s as keys, the default hasher is unnecessary overhead.
#[derive(Clone, Default, Debug)]
struct IdHasher(u64);

impl Hasher for IdHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("TypeId calls write_u64");
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.0 = id;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct ValueA(&'static str);
    #[derive(Debug, PartialEq)]
    struct ValueB(u64);

    #[test]
    fn nested_contexts() {
        let outer = Context::new().with_value(ValueA("a"));
        let inner = outer.with_value(ValueB(42));

        assert_eq!(outer.get::<ValueA>(), Some(&ValueA("a")));
        assert_eq!(outer.get::<ValueB>(), None);
        assert_eq!(inner.get::<ValueA>(), Some(&ValueA("a")));
        assert_eq!(inner.get::<ValueB>(), Some(&ValueB(42)));
    }

    #[test]
    fn replacing_a_value_does_not_affect_the_parent() {
        let outer = Context::new().with_value(ValueB(1));
        let inner = outer.with_value(ValueB(2));

        assert_eq!(outer.get::<ValueB>(), Some(&ValueB(1)));
        assert_eq!(inner.get::<ValueB>(), Some(&ValueB(2)));
    }

    #[test]
    fn detached_context_ignores_cancellation_but_keeps_values() {
        let cancel = CancelSignal::new();
        let cx = Context::new()
            .with_value(ValueA("kept"))
            .with_cancel(cancel.clone());
        let detached = cx.detached();

        cancel.cancel();

        assert!(cx.is_done());
        assert!(!detached.is_done());
        assert_eq!(detached.get::<ValueA>(), Some(&ValueA("kept")));
    }
}
