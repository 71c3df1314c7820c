//! Raw FFI bindings to the chatglm.cpp C shim (`binding.h`).
//!
//! The bindings are generated only when the native library was found at
//! build time; see `build.rs`.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

#[cfg(chatglm_bindings)]
include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// `true` when this build links the native engine.
pub const LINKED: bool = cfg!(chatglm_bindings);

#[cfg(all(feature = "required", not(chatglm_bindings)))]
compile_error!("chatglm-sys was built with `required` but chatglm.cpp was not linked");
