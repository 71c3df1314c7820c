//! Which engine the binary drives.

use chatglm_core::Engine;

#[cfg(feature = "native")]
pub type DefaultBackend = chatglm_core::NativeBackend;
#[cfg(not(feature = "native"))]
pub type DefaultBackend = chatglm_core::ScriptedBackend;

#[cfg(feature = "native")]
pub fn open() -> anyhow::Result<Engine<DefaultBackend>> {
    Ok(Engine::new(chatglm_core::NativeBackend::new()))
}

#[cfg(not(feature = "native"))]
pub fn open() -> anyhow::Result<Engine<DefaultBackend>> {
    anyhow::bail!("This binary was built without the chatglm.cpp engine; rebuild with `--features native`")
}
