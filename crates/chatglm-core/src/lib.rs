//! Safe Rust orchestration layer around the chatglm.cpp engine.
//!
//! Provides generation-config translation, multi-turn prompt rendering,
//! RAII-managed pipeline handles, and a bridge from the engine's streaming
//! callbacks to a pull-style chunk stream.

pub mod backend;
#[cfg_attr(not(feature = "native"), allow(dead_code))]
mod callback;
pub mod config;
pub mod error;
pub mod handle;
#[cfg(feature = "native")]
pub mod native;
pub mod prompt;
pub mod registry;
pub mod scripted;
pub mod stream;

pub use backend::{Backend, TextCallback};
pub use config::{GenerateOption, GenerationConfig, ScopedConfig};
pub use error::{ChatGlmError, Result};
pub use handle::{Engine, EngineHandle};
#[cfg(feature = "native")]
pub use native::NativeBackend;
pub use prompt::{Conversation, PromptBuilder, Turn, build_prompt};
pub use registry::{CallbackRegistry, HandleId, Sink};
pub use scripted::ScriptedBackend;
pub use stream::{BlockingChunks, ChunkStream, FinishReason, GenerateEvent};
