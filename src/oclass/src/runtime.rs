//! Objective-C runtime expression dialect
//!
//! Every expression the engine evaluates in the target is built here, so the
//! layout knowledge (block syntax, scratch buffer format, which runtime
//! primitive answers which question) lives in one place. The debugger's
//! expression evaluator does not accept GCC statement expressions, so
//! compound work is phrased as an immediately-invoked block.

use std::fmt::Write;

use crate::types::ClassHandle;

/// One compound call that snapshots the registered-class list: invokes
/// `objc_copyClassList` and parks `[list_ptr, count]` as two `u64` slots in
/// a 16-byte scratch header the caller bulk-reads next.
pub(crate) fn copy_class_list_expr() -> String {
    "(void *)(^{\n\
     \x20   unsigned long long *out = (unsigned long long *)malloc(16);\n\
     \x20   if (!out) return (void *)0;\n\
     \x20   unsigned int count = 0;\n\
     \x20   Class *list = objc_copyClassList(&count);\n\
     \x20   out[0] = (unsigned long long)list;\n\
     \x20   out[1] = (unsigned long long)count;\n\
     \x20   return (void *)out;\n\
     }())"
        .to_string()
}

/// Direct name-to-class lookup, the fast path for exact queries.
pub(crate) fn get_class_expr(name: &str) -> String {
    format!("(Class)objc_getClass(\"{}\")", escape_c_string(name))
}

/// Plain single-handle name lookup, the degraded path when a batch fails.
pub(crate) fn single_name_expr(handle: ClassHandle) -> String {
    format!("(const char *)class_getName((Class){:#x})", handle.0)
}

pub(crate) fn single_superclass_expr(handle: ClassHandle) -> String {
    format!("(Class)class_getSuperclass((Class){:#x})", handle.0)
}

/// Per-batch body resolving `class_getName` for each handle into the
/// consolidated payload behind the offset table.
pub(crate) fn batch_names_body(handles: &[ClassHandle], capacity: usize) -> String {
    string_batch_body(handles, capacity, "class_getName")
}

/// Per-batch body resolving `class_getImageName` (the containing dylib).
pub(crate) fn batch_image_body(handles: &[ClassHandle], capacity: usize) -> String {
    string_batch_body(handles, capacity, "class_getImageName")
}

fn string_batch_body(handles: &[ClassHandle], capacity: usize, call: &str) -> String {
    let mut body = String::new();
    for (i, handle) in handles.iter().enumerate() {
        let _ = write!(
            body,
            "    const char *n{i} = (const char *){call}((Class){handle:#x});\n\
             \x20   if (n{i}) {{\n\
             \x20       unsigned long l{i} = (unsigned long)strlen(n{i}) + 1;\n\
             \x20       if (cursor + l{i} <= {capacity}) {{\n\
             \x20           offsets[{i}] = cursor;\n\
             \x20           (void)memcpy(payload + cursor, n{i}, l{i});\n\
             \x20           cursor += l{i};\n\
             \x20       }} else {{\n\
             \x20           offsets[{i}] = 0xFFFFFFFF;\n\
             \x20       }}\n\
             \x20   }} else {{\n\
             \x20       offsets[{i}] = 0xFFFFFFFF;\n\
             \x20   }}\n",
            handle = handle.0,
        );
    }
    body
}

/// Per-batch body resolving one ancestry level: each item's payload is the
/// superclass pointer (target pointer width) followed by its name.
pub(crate) fn batch_superclass_body(
    handles: &[ClassHandle],
    capacity: usize,
    pointer_width: usize,
) -> String {
    let mut body = String::new();
    for (i, handle) in handles.iter().enumerate() {
        let _ = write!(
            body,
            "    Class s{i} = (Class)class_getSuperclass((Class){handle:#x});\n\
             \x20   const char *p{i} = s{i} ? (const char *)class_getName(s{i}) : (const char *)0;\n\
             \x20   if (p{i}) {{\n\
             \x20       unsigned long l{i} = (unsigned long)strlen(p{i}) + 1;\n\
             \x20       if (cursor + {pointer_width} + l{i} <= {capacity}) {{\n\
             \x20           offsets[{i}] = cursor;\n\
             \x20           (void)memcpy(payload + cursor, &s{i}, {pointer_width});\n\
             \x20           (void)memcpy(payload + cursor + {pointer_width}, p{i}, l{i});\n\
             \x20           cursor += {pointer_width} + l{i};\n\
             \x20       }} else {{\n\
             \x20           offsets[{i}] = 0xFFFFFFFF;\n\
             \x20       }}\n\
             \x20   }} else {{\n\
             \x20       offsets[{i}] = 0xFFFFFFFF;\n\
             \x20   }}\n",
            handle = handle.0,
        );
    }
    body
}

fn escape_c_string(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}
