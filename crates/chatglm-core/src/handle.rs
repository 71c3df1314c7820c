//! Loaded pipelines and the engine that creates them.

use std::mem::ManuallyDrop;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::{GenerationConfig, ScopedConfig};
use crate::error::Result;
use crate::registry::{CallbackRegistry, HandleId, Sink};
use crate::stream::{self, ChunkStream};

/// Entry point: a backend plus the registry shared by all of its handles.
pub struct Engine<B: Backend> {
    backend: Arc<B>,
    registry: Arc<CallbackRegistry>,
}

impl<B: Backend> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            registry: Arc::new(CallbackRegistry::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Load a model from `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<EngineHandle<B>> {
        let path = path.as_ref();
        info!(backend = self.backend.name(), path = %path.display(), "Loading model…");
        let pipeline = self.backend.create_pipeline(path)?;
        let id = HandleId::next();
        info!(handle = %id, path = %path.display(), "Model loaded");

        Ok(EngineHandle {
            inner: Arc::new(HandleInner {
                id,
                path: path.to_path_buf(),
                backend: Arc::clone(&self.backend),
                registry: Arc::clone(&self.registry),
                flight: Mutex::new(()),
                pipeline: ManuallyDrop::new(pipeline),
            }),
        })
    }
}

/// Exclusive owner of one loaded pipeline.
///
/// Not `Clone`. [`EngineHandle::release`] consumes the handle, so a released
/// pipeline cannot be used or released again. Dropping the handle releases it
/// as well. Streams still running keep the pipeline alive until they end.
pub struct EngineHandle<B: Backend> {
    inner: Arc<HandleInner<B>>,
}

impl<B: Backend> EngineHandle<B> {
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Generate a complete response, blocking the calling thread.
    ///
    /// Calls on the same handle are serialized.
    pub fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        let collector = Arc::new(Collector::default());
        self.inner.run(prompt, config, collector.clone())?;
        Ok(collector.take())
    }

    /// Start generation on a separate task and return its chunks as they are
    /// produced.
    ///
    /// Streams on the same handle run one after another; a second stream
    /// waits for the first to end before it starts.
    pub fn stream_generate(&self, prompt: &str, config: &GenerationConfig) -> Result<ChunkStream> {
        stream::spawn(Arc::clone(&self.inner), prompt.to_owned(), config.clone())
    }

    /// Release the pipeline.
    pub fn release(self) {
        let streams = Arc::strong_count(&self.inner) - 1;
        if streams > 0 {
            debug!(handle = %self.inner.id, streams, "Release deferred until running streams end");
        }
    }
}

pub(crate) struct HandleInner<B: Backend> {
    id: HandleId,
    path: PathBuf,
    backend: Arc<B>,
    registry: Arc<CallbackRegistry>,
    /// Single-flight guard: one native call per pipeline at a time.
    flight: Mutex<()>,
    pipeline: ManuallyDrop<B::Pipeline>,
}

impl<B: Backend> HandleInner<B> {
    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    /// Drive one native generate call, routing its text to `sink`.
    pub(crate) fn run(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        sink: Arc<dyn Sink>,
    ) -> Result<()> {
        let _flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
        let native_config = ScopedConfig::acquire(&*self.backend, config)?;

        self.registry.register(self.id, Arc::clone(&sink));
        let _registration = Registration {
            registry: &self.registry,
            id: self.id,
        };
        sink.registered();

        let registry = &self.registry;
        let id = self.id;
        self.backend.generate(
            &self.pipeline,
            prompt,
            native_config.raw(),
            &mut |text, is_end| registry.dispatch(id, text, is_end),
        )
    }
}

impl<B: Backend> Drop for HandleInner<B> {
    fn drop(&mut self) {
        // Safety: the pipeline is taken exactly once, here.
        let pipeline = unsafe { ManuallyDrop::take(&mut self.pipeline) };
        self.backend.destroy_pipeline(pipeline);
        info!(handle = %self.id, path = %self.path.display(), "Model released");
    }
}

/// Removes a registration on every exit path of a native call.
struct Registration<'a> {
    registry: &'a CallbackRegistry,
    id: HandleId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.registry.unregister(self.id) {
            debug!(handle = %self.id, "Dropped registration left open by the engine");
        }
    }
}

/// Sink that aggregates text for the synchronous path.
#[derive(Default)]
struct Collector {
    text: Mutex<String>,
}

impl Collector {
    fn take(&self) -> String {
        std::mem::take(&mut *self.text.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Sink for Collector {
    fn deliver(&self, text: &str, _is_end: bool) -> ControlFlow<()> {
        if !text.is_empty() {
            self.text
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(text);
        }
        ControlFlow::Continue(())
    }
}
