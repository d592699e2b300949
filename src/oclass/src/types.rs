//! Core value types shared across the engine
//!
//! Handles stay opaque numeric identifiers: a `ClassHandle` is a `Class`
//! pointer inside the debuggee and must never be dereferenced locally, only
//! handed back to the target through an expression.

use serde::Serialize;

/// Opaque identifier for a class registered in the target runtime.
///
/// Only meaningful within the [`ProcessSession`] it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ClassHandle(pub u64);

impl std::fmt::Display for ClassHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A resolved class record.
///
/// `name` is always non-empty once stored; `module_path` (the image/dylib
/// the class was loaded from) and `parent` are filled in on demand only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassInfo {
    pub handle: ClassHandle,
    pub name: String,
    pub module_path: Option<String>,
    pub parent: Option<ClassHandle>,
}

impl ClassInfo {
    pub fn new(handle: ClassHandle, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
            module_path: None,
            parent: None,
        }
    }
}

/// Identity of one running instance of the target process.
///
/// The generation counter changes across relaunches, so a new process that
/// happens to reuse a pid never inherits cached state from the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessSession {
    pub pid: u64,
    pub generation: u32,
}

impl ProcessSession {
    pub fn new(pid: u64, generation: u32) -> Self {
        Self { pid, generation }
    }
}

impl std::fmt::Display for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} gen {}", self.pid, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_handle_display() {
        let handle = ClassHandle(0x1f00a0);
        assert_eq!(handle.to_string(), "0x1f00a0");
    }

    #[test]
    fn test_class_info_new_defaults() {
        let info = ClassInfo::new(ClassHandle(0x1000), "NSObject");
        assert_eq!(info.name, "NSObject");
        assert!(info.module_path.is_none());
        assert!(info.parent.is_none());
    }

    #[test]
    fn test_session_identity_includes_generation() {
        let a = ProcessSession::new(4242, 1);
        let b = ProcessSession::new(4242, 2);
        assert_ne!(a, b);
        assert_eq!(a, ProcessSession::new(4242, 1));
    }
}
