//! Thread-local runtime error slot.
//!
//! Ported from the teacher's `crates/runtime/src/error.rs` thread-local
//! `LAST_ERROR` cell, minus the `extern "C"` / CString export wrappers —
//! there's no C ABI boundary here, just the "VM-style" native-function
//! calling convention from spec §6, which reads this slot after a builtin
//! returns to decide whether it failed.

use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn set_runtime_error(message: impl Into<String>) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(message.into()));
}

pub fn take_runtime_error() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow_mut().take())
}

pub fn has_runtime_error() -> bool {
    LAST_ERROR.with(|cell| cell.borrow().is_some())
}

pub fn clear_runtime_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Turns a caught panic payload into a readable message, for native
/// functions run under `catch_unwind`.
pub fn format_panic_payload(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "native function panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_take_roundtrip() {
        clear_runtime_error();
        assert!(!has_runtime_error());
        set_runtime_error("boom");
        assert!(has_runtime_error());
        assert_eq!(take_runtime_error(), Some("boom".to_string()));
        assert!(!has_runtime_error());
    }

    #[test]
    fn panic_payload_string() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("oops".to_string());
        assert_eq!(format_panic_payload(payload), "oops");
    }
}
