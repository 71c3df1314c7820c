//! chatglm.cpp backend over the `chatglm-sys` shim.

use std::ffi::{CStr, CString};
use std::path::Path;
use std::ptr::NonNull;

use tracing::debug;

use crate::backend::{Backend, TextCallback};
use crate::callback::{CallbackState, forward_text};
use crate::config::{GenerationConfig, to_c_int};
use crate::error::{ChatGlmError, Result};

/// The chatglm.cpp engine.
#[derive(Debug, Default)]
pub struct NativeBackend {
    _private: (),
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Owns a `Pipeline*` until it is handed back to
/// [`Backend::destroy_pipeline`].
pub struct NativePipeline {
    ptr: NonNull<chatglm_sys::Pipeline>,
}

// Safety: the pipeline is only driven by one generate call at a time
// (single-flight lock in `EngineHandle`); creation and destruction happen on
// the owning handle.
unsafe impl Send for NativePipeline {}
unsafe impl Sync for NativePipeline {}

/// Owns a `GenerationConfig*` for one call.
pub struct NativeConfig {
    ptr: NonNull<chatglm_sys::GenerationConfig>,
}

fn last_error() -> String {
    unsafe {
        let p = chatglm_sys::Chatglm_LastError();
        if p.is_null() {
            "unknown native error".into()
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    }
}

impl Backend for NativeBackend {
    type Pipeline = NativePipeline;
    type Config = NativeConfig;

    fn name(&self) -> &'static str {
        "chatglm.cpp"
    }

    fn create_pipeline(&self, path: &Path) -> Result<NativePipeline> {
        let path_str = path.to_str().ok_or_else(|| ChatGlmError::ModelLoadFailed {
            path: path.display().to_string(),
            reason: "Invalid UTF-8 in path".into(),
        })?;
        let c_path = CString::new(path_str).map_err(|_| ChatGlmError::ModelLoadFailed {
            path: path_str.into(),
            reason: "Path contains null byte".into(),
        })?;

        let raw = unsafe { chatglm_sys::NewPipeline(c_path.as_ptr()) };
        let ptr = NonNull::new(raw).ok_or_else(|| ChatGlmError::ModelLoadFailed {
            path: path_str.into(),
            reason: last_error(),
        })?;
        Ok(NativePipeline { ptr })
    }

    fn destroy_pipeline(&self, pipeline: NativePipeline) {
        debug!("Freeing chatglm pipeline");
        unsafe { chatglm_sys::DeletePipeline(pipeline.ptr.as_ptr()) }
    }

    fn create_config(&self, config: &GenerationConfig) -> Result<NativeConfig> {
        let raw = unsafe {
            chatglm_sys::NewGenerationConfig(
                to_c_int("max_length", config.max_length)?,
                to_c_int("max_context_length", config.max_context_length)?,
                config.do_sample,
                to_c_int("top_k", config.top_k)?,
                config.top_p,
                config.temperature,
                config.repetition_penalty,
                to_c_int("num_threads", config.num_threads)?,
            )
        };
        let ptr = NonNull::new(raw).ok_or(ChatGlmError::NullPointer)?;
        Ok(NativeConfig { ptr })
    }

    fn destroy_config(&self, config: NativeConfig) {
        unsafe { chatglm_sys::DeleteGenerationConfig(config.ptr.as_ptr()) }
    }

    fn generate(
        &self,
        pipeline: &NativePipeline,
        prompt: &str,
        config: &NativeConfig,
        on_text: TextCallback<'_>,
    ) -> Result<()> {
        let c_prompt = CString::new(prompt)
            .map_err(|_| ChatGlmError::InvalidPrompt("prompt contains a null byte".into()))?;

        let mut state = CallbackState::new(on_text);
        let rc = unsafe {
            chatglm_sys::Pipeline_Generate(
                pipeline.ptr.as_ptr(),
                c_prompt.as_ptr(),
                config.ptr.as_ptr(),
                Some(forward_text),
                state.as_user_data(),
            )
        };

        if let Some(msg) = state.take_panic() {
            return Err(ChatGlmError::FfiPanic(msg));
        }
        if rc != 0 {
            return Err(ChatGlmError::GenerationFailed(last_error()));
        }
        Ok(())
    }
}
