//! Deterministic in-process backend.
//!
//! Replies come from a script function instead of a model, which makes the
//! orchestration layer testable without weights. The backend counts every
//! resource it hands out so callers can check that pipelines and configs are
//! released.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::backend::{Backend, TextCallback};
use crate::config::GenerationConfig;
use crate::error::{ChatGlmError, Result};

type Script = dyn Fn(&str, &GenerationConfig) -> Vec<String> + Send + Sync;

pub struct ScriptedBackend {
    script: Box<Script>,
    failing_paths: HashSet<PathBuf>,
    fail_after: Option<usize>,
    chunk_delay: Option<Duration>,
    late_callback: bool,
    pipelines_created: AtomicUsize,
    pipelines_destroyed: AtomicUsize,
    configs_created: AtomicUsize,
    configs_destroyed: AtomicUsize,
    last_config: Mutex<Option<GenerationConfig>>,
}

/// A pipeline "loaded" by [`ScriptedBackend`].
#[derive(Debug)]
pub struct ScriptedPipeline {
    path: PathBuf,
}

impl ScriptedPipeline {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScriptedBackend {
    /// Reply with the chunks returned by `script` for each prompt.
    ///
    /// Like the native engine, the last chunk is delivered together with the
    /// end signal.
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &GenerationConfig) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            failing_paths: HashSet::new(),
            fail_after: None,
            chunk_delay: None,
            late_callback: false,
            pipelines_created: AtomicUsize::new(0),
            pipelines_destroyed: AtomicUsize::new(0),
            configs_created: AtomicUsize::new(0),
            configs_destroyed: AtomicUsize::new(0),
            last_config: Mutex::new(None),
        }
    }

    /// Echo the prompt back, one space-terminated word per chunk.
    pub fn echo() -> Self {
        Self::new(|prompt, _| prompt.split_inclusive(' ').map(str::to_owned).collect())
    }

    /// Make loading `path` fail.
    pub fn failing_load(mut self, path: impl Into<PathBuf>) -> Self {
        self.failing_paths.insert(path.into());
        self
    }

    /// Fail generation after `n` chunks, without an end signal.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep before every chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Send one more callback after the end signal, as a misbehaving engine
    /// would.
    pub fn with_late_callback(mut self) -> Self {
        self.late_callback = true;
        self
    }

    pub fn pipelines_created(&self) -> usize {
        self.pipelines_created.load(Ordering::SeqCst)
    }

    pub fn pipelines_destroyed(&self) -> usize {
        self.pipelines_destroyed.load(Ordering::SeqCst)
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines_created() - self.pipelines_destroyed()
    }

    pub fn configs_created(&self) -> usize {
        self.configs_created.load(Ordering::SeqCst)
    }

    pub fn live_configs(&self) -> usize {
        self.configs_created() - self.configs_destroyed.load(Ordering::SeqCst)
    }

    /// Settings seen by the most recent generate call.
    pub fn last_config(&self) -> Option<GenerationConfig> {
        self.last_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Backend for ScriptedBackend {
    type Pipeline = ScriptedPipeline;
    type Config = GenerationConfig;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create_pipeline(&self, path: &Path) -> Result<ScriptedPipeline> {
        if self.failing_paths.contains(path) {
            return Err(ChatGlmError::ModelLoadFailed {
                path: path.display().to_string(),
                reason: "scripted load failure".into(),
            });
        }
        self.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedPipeline {
            path: path.to_path_buf(),
        })
    }

    fn destroy_pipeline(&self, _pipeline: ScriptedPipeline) {
        self.pipelines_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn create_config(&self, config: &GenerationConfig) -> Result<GenerationConfig> {
        self.configs_created.fetch_add(1, Ordering::SeqCst);
        Ok(config.clone())
    }

    fn destroy_config(&self, _config: GenerationConfig) {
        self.configs_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn generate(
        &self,
        _pipeline: &ScriptedPipeline,
        prompt: &str,
        config: &GenerationConfig,
        on_text: TextCallback<'_>,
    ) -> Result<()> {
        *self.last_config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());

        let chunks = (self.script)(prompt, config);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.iter().enumerate() {
            if self.fail_after == Some(i) {
                return Err(ChatGlmError::GenerationFailed(format!(
                    "scripted failure after {i} chunks"
                )));
            }
            if let Some(delay) = self.chunk_delay {
                std::thread::sleep(delay);
            }
            let is_end = i == last;
            if on_text(chunk, is_end).is_break() && !is_end {
                // Stop text, but still close the stream like the engine does.
                let _ = on_text("", true);
                return Ok(());
            }
        }
        if chunks.is_empty() {
            let _ = on_text("", true);
        }

        if self.late_callback {
            let _ = on_text("late", false);
        }
        Ok(())
    }
}
