//! The boundary to the native inference engine.
//!
//! Everything behind this trait (weights, tokenizer, sampler, context
//! management) belongs to the engine. The rest of the crate only creates and
//! destroys its resources and receives generated text through a callback.

use std::ops::ControlFlow;
use std::path::Path;

use crate::config::GenerationConfig;
use crate::error::Result;

/// Callback through which an engine pushes generated text.
///
/// Called zero or more times with `is_end = false` and exactly once with
/// `is_end = true` (the end call may carry trailing text). Returning
/// [`ControlFlow::Break`] asks the engine to stop delivering text.
pub type TextCallback<'a> = &'a mut dyn FnMut(&str, bool) -> ControlFlow<()>;

/// A text-generation engine.
///
/// Implementations are shared across threads; a single pipeline is only ever
/// driven by one `generate` call at a time.
pub trait Backend: Send + Sync + 'static {
    /// A loaded model pipeline.
    type Pipeline: Send + Sync + 'static;
    /// Native generation settings, valid for one call.
    type Config;

    fn name(&self) -> &'static str;

    /// Load weights from `path` and build a pipeline.
    fn create_pipeline(&self, path: &Path) -> Result<Self::Pipeline>;

    fn destroy_pipeline(&self, pipeline: Self::Pipeline);

    fn create_config(&self, config: &GenerationConfig) -> Result<Self::Config>;

    fn destroy_config(&self, config: Self::Config);

    /// Run generation to completion, pushing text into `on_text`.
    ///
    /// Blocks the calling thread until the engine finishes.
    fn generate(
        &self,
        pipeline: &Self::Pipeline,
        prompt: &str,
        config: &Self::Config,
        on_text: TextCallback<'_>,
    ) -> Result<()>;
}
