//! Routing of engine callbacks to the sink of the session that is running on
//! a handle.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

/// Identity of a loaded [`EngineHandle`](crate::EngineHandle).
///
/// Allocated from a process-wide counter and never reused, so a stale
/// registration can never be mistaken for a newer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiver of generated text.
pub trait Sink: Send + Sync {
    fn deliver(&self, text: &str, is_end: bool) -> ControlFlow<()>;

    /// Called once the sink is installed and the engine is about to run.
    fn registered(&self) {}
}

impl<F> Sink for F
where
    F: Fn(&str, bool) -> ControlFlow<()> + Send + Sync,
{
    fn deliver(&self, text: &str, is_end: bool) -> ControlFlow<()> {
        self(text, is_end)
    }
}

/// Concurrency-safe map from handle identity to the active sink.
#[derive(Default)]
pub struct CallbackRegistry {
    sinks: DashMap<HandleId, Arc<dyn Sink>>,
    misses: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `sink` for `id`, replacing (and returning) any previous one.
    pub fn register(&self, id: HandleId, sink: Arc<dyn Sink>) -> Option<Arc<dyn Sink>> {
        let previous = self.sinks.insert(id, sink);
        if previous.is_some() {
            warn!(handle = %id, "Replaced an active sink registration");
        }
        previous
    }

    /// Remove the sink for `id`. Returns `false` if none was registered.
    pub fn unregister(&self, id: HandleId) -> bool {
        self.sinks.remove(&id).is_some()
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.sinks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Callbacks that arrived for a handle with no registered sink.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Route one engine callback to the sink registered for `id`.
    ///
    /// The end-of-stream call removes the registration. No map lock is held
    /// while the sink runs.
    pub fn dispatch(&self, id: HandleId, text: &str, is_end: bool) -> ControlFlow<()> {
        let sink = if is_end {
            self.sinks.remove(&id).map(|(_, sink)| sink)
        } else {
            self.sinks.get(&id).map(|entry| Arc::clone(entry.value()))
        };

        match sink {
            Some(sink) => sink.deliver(text, is_end),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(handle = %id, is_end, "Callback for unregistered handle dropped");
                ControlFlow::Break(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording_sink() -> (Arc<Mutex<Vec<(String, bool)>>>, Arc<dyn Sink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: Arc<dyn Sink> = Arc::new(move |text: &str, is_end: bool| {
            sink_seen.lock().unwrap().push((text.to_string(), is_end));
            ControlFlow::Continue(())
        });
        (seen, sink)
    }

    #[test]
    fn handle_ids_are_unique() {
        let a = HandleId::next();
        let b = HandleId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn register_then_unregister_leaves_no_entry() {
        let registry = CallbackRegistry::new();
        let id = HandleId::next();
        let (_, sink) = recording_sink();

        assert!(registry.register(id, sink).is_none());
        assert!(registry.contains(id));
        assert!(registry.unregister(id));
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_absent_key_is_noop() {
        let registry = CallbackRegistry::new();
        assert!(!registry.unregister(HandleId::next()));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn dispatch_after_unregister_has_no_effect() {
        let registry = CallbackRegistry::new();
        let id = HandleId::next();
        let (seen, sink) = recording_sink();

        registry.register(id, sink);
        assert!(registry.dispatch(id, "a", false).is_continue());
        registry.unregister(id);
        assert!(registry.dispatch(id, "b", false).is_break());

        assert_eq!(*seen.lock().unwrap(), vec![("a".to_string(), false)]);
        assert_eq!(registry.misses(), 1);
    }

    #[test]
    fn end_signal_removes_registration() {
        let registry = CallbackRegistry::new();
        let id = HandleId::next();
        let (seen, sink) = recording_sink();

        registry.register(id, sink);
        registry.dispatch(id, "tail", true);
        assert!(!registry.contains(id));

        registry.dispatch(id, "late", false);
        assert_eq!(*seen.lock().unwrap(), vec![("tail".to_string(), true)]);
    }

    #[test]
    fn second_registration_overwrites_first() {
        let registry = CallbackRegistry::new();
        let id = HandleId::next();
        let (first_seen, first) = recording_sink();
        let (second_seen, second) = recording_sink();

        registry.register(id, first);
        assert!(registry.register(id, second).is_some());
        registry.dispatch(id, "x", false);

        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn distinct_handles_do_not_cross_talk() {
        let registry = Arc::new(CallbackRegistry::new());
        let workers: Vec<_> = (0..8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let id = HandleId::next();
                    let (seen, sink) = recording_sink();
                    registry.register(id, sink);
                    for i in 0..100 {
                        registry.dispatch(id, &format!("{n}:{i}"), false);
                    }
                    registry.dispatch(id, "", true);
                    let seen = seen.lock().unwrap();
                    assert_eq!(seen.len(), 101);
                    assert!(seen[..100].iter().all(|(t, _)| t.starts_with(&format!("{n}:"))));
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert!(registry.is_empty());
        assert_eq!(registry.misses(), 0);
    }
}
