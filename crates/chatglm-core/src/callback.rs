//! C callback trampoline for engines that push text through a
//! `(user_data, text, is_end)` function pointer.

use std::any::Any;
use std::borrow::Cow;
use std::ffi::CStr;
use std::ops::ControlFlow;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};

use crate::backend::TextCallback;

/// Passed as `user_data` for the duration of one native call.
pub(crate) struct CallbackState<'a> {
    on_text: TextCallback<'a>,
    panic: Option<String>,
}

impl<'a> CallbackState<'a> {
    pub(crate) fn new(on_text: TextCallback<'a>) -> Self {
        Self {
            on_text,
            panic: None,
        }
    }

    /// Message of a panic caught inside the callback, if any.
    pub(crate) fn take_panic(&mut self) -> Option<String> {
        self.panic.take()
    }

    pub(crate) fn as_user_data(&mut self) -> *mut c_void {
        (self as *mut CallbackState<'a>).cast::<c_void>()
    }
}

/// Returns 0 to continue, non-zero to stop the engine.
///
/// # Safety
///
/// `user_data` must be null or point to a live `CallbackState` not otherwise
/// borrowed, and `text` must be null or a NUL-terminated string.
pub(crate) unsafe extern "C" fn forward_text(
    user_data: *mut c_void,
    text: *const c_char,
    is_end: c_int,
) -> c_int {
    if user_data.is_null() {
        return 1;
    }
    // Safety: `user_data` is the `CallbackState` owned by the frame that is
    // blocked inside the native call.
    let state = unsafe { &mut *user_data.cast::<CallbackState<'_>>() };
    if state.panic.is_some() {
        return 1;
    }

    let text = if text.is_null() {
        Cow::Borrowed("")
    } else {
        unsafe { CStr::from_ptr(text) }.to_string_lossy()
    };

    match panic::catch_unwind(AssertUnwindSafe(|| (state.on_text)(&text, is_end != 0))) {
        Ok(ControlFlow::Continue(())) => 0,
        Ok(ControlFlow::Break(())) => 1,
        Err(payload) => {
            state.panic = Some(panic_message(payload));
            1
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".into()
    }
}
