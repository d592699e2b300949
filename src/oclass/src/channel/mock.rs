//! Mock Target Channel
//!
//! A scriptable fake debuggee for testing the enumeration pipeline. It
//! emulates the runtime primitives the engine evaluates (`objc_copyClassList`,
//! `class_getName`, `objc_getClass`, `class_getSuperclass`,
//! `class_getImageName`), honors scratch `malloc`/`free` with a bump
//! allocator, counts invocations per channel, and injects failures:
//! unavailable target, expression-size limits, truncated array reads,
//! per-handle name failures, and cancellation after N evaluations.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use byteorder::{ByteOrder, LE};

use super::traits::{ByteOrdering, ChannelError, TargetChannel, Value};
use crate::query::CancelToken;
use crate::types::ProcessSession;

const HANDLE_BASE: u64 = 0x10_0000;
const SCRATCH_BASE: u64 = 0x50_0000;
const OFFSET_UNRESOLVED: u32 = 0xFFFF_FFFF;

struct MockClass {
    name: String,
    parent: u64,
    image: Option<String>,
}

#[derive(Default)]
struct MockRuntime {
    by_handle: HashMap<u64, MockClass>,
    by_name: HashMap<String, u64>,
    order: Vec<u64>,
    blocks: HashMap<u64, Vec<u8>>,
    next_alloc: u64,
}

impl MockRuntime {
    fn alloc(&mut self, data: Vec<u8>) -> u64 {
        if self.next_alloc == 0 {
            self.next_alloc = SCRATCH_BASE;
        }
        let addr = self.next_alloc;
        let span = ((data.len() as u64 + 0x3F) & !0x3F).max(0x40);
        self.next_alloc += span;
        self.blocks.insert(addr, data);
        addr
    }
}

pub struct MockChannel {
    state: RefCell<MockRuntime>,
    pid: u64,
    generation: Cell<u32>,
    pointer_width: usize,
    pub evaluations: Cell<u64>,
    pub reads: Cell<u64>,
    pub unavailable: Cell<bool>,
    pub max_expr_len: Cell<Option<usize>>,
    pub truncate_list: Cell<bool>,
    fail_names: RefCell<HashSet<u64>>,
    cancel_after: RefCell<Option<(u64, CancelToken)>>,
    eval_log: RefCell<Vec<&'static str>>,
}

impl MockChannel {
    pub fn new(pid: u64) -> Self {
        Self {
            state: RefCell::new(MockRuntime::default()),
            pid,
            generation: Cell::new(1),
            pointer_width: 8,
            evaluations: Cell::new(0),
            reads: Cell::new(0),
            unavailable: Cell::new(false),
            max_expr_len: Cell::new(None),
            truncate_list: Cell::new(false),
            fail_names: RefCell::new(HashSet::new()),
            cancel_after: RefCell::new(None),
            eval_log: RefCell::new(Vec::new()),
        }
    }

    pub fn with_classes(pid: u64, names: &[&str]) -> Self {
        let channel = Self::new(pid);
        for name in names {
            channel.add_class(name);
        }
        channel
    }

    /// Register a class and return its handle.
    pub fn add_class(&self, name: &str) -> u64 {
        let mut st = self.state.borrow_mut();
        let handle = HANDLE_BASE + st.order.len() as u64 * 0x40;
        st.by_handle.insert(
            handle,
            MockClass {
                name: name.to_string(),
                parent: 0,
                image: None,
            },
        );
        st.by_name.insert(name.to_string(), handle);
        st.order.push(handle);
        handle
    }

    pub fn handle_of(&self, name: &str) -> u64 {
        self.state.borrow().by_name[name]
    }

    pub fn link_parent(&self, child: &str, parent: &str) {
        let (child, parent) = (self.handle_of(child), self.handle_of(parent));
        self.link_parent_handle(child, parent);
    }

    pub fn link_parent_handle(&self, child: u64, parent: u64) {
        let mut st = self.state.borrow_mut();
        if let Some(class) = st.by_handle.get_mut(&child) {
            class.parent = parent;
        }
    }

    pub fn set_image(&self, name: &str, path: &str) {
        let handle = self.handle_of(name);
        let mut st = self.state.borrow_mut();
        if let Some(class) = st.by_handle.get_mut(&handle) {
            class.image = Some(path.to_string());
        }
    }

    /// Make name resolution fail for this class, in batches and singly.
    pub fn fail_name_of(&self, name: &str) {
        let handle = self.handle_of(name);
        self.fail_names.borrow_mut().insert(handle);
    }

    /// Simulate a target relaunch: same pid, new generation.
    pub fn relaunch(&self) {
        self.generation.set(self.generation.get() + 1);
    }

    /// Cancel `token` once the Nth evaluation (1-based) has been issued.
    pub fn cancel_after(&self, nth: u64, token: CancelToken) {
        *self.cancel_after.borrow_mut() = Some((nth, token));
    }

    /// Number of evaluations of a given kind seen so far.
    pub fn calls(&self, kind: &str) -> usize {
        self.eval_log.borrow().iter().filter(|k| **k == kind).count()
    }

    pub fn live_scratch_blocks(&self) -> usize {
        self.state.borrow().blocks.len()
    }

    fn log(&self, kind: &'static str) {
        self.eval_log.borrow_mut().push(kind);
    }

    fn eval_copy_class_list(&self) -> Result<Value, ChannelError> {
        let mut st = self.state.borrow_mut();
        let count = st.order.len();
        let mut array = Vec::with_capacity(count * self.pointer_width);
        for &handle in &st.order {
            let mut word = [0u8; 8];
            LE::write_u64(&mut word, handle);
            array.extend_from_slice(&word[..self.pointer_width]);
        }
        if self.truncate_list.get() && array.len() >= self.pointer_width * 2 {
            let keep = array.len() - self.pointer_width * 2;
            array.truncate(keep);
        }
        let list_ptr = st.alloc(array);
        let mut header = vec![0u8; 16];
        LE::write_u64(&mut header[0..8], list_ptr);
        LE::write_u64(&mut header[8..16], count as u64);
        Ok(Value::Pointer(st.alloc(header)))
    }

    fn eval_fast_path(&self, expr: &str) -> Result<Value, ChannelError> {
        let name = quoted_arg(expr, "objc_getClass(\"")
            .ok_or_else(|| ChannelError::Evaluation("malformed objc_getClass".into()))?;
        let st = self.state.borrow();
        Ok(Value::Pointer(st.by_name.get(&name).copied().unwrap_or(0)))
    }

    /// Fill a consolidated string buffer the way the target-side block would.
    fn eval_string_batch(&self, expr: &str, call: &str) -> Result<Value, ChannelError> {
        let handles = hex_args(expr, &format!("{call}((Class)0x"));
        let buffer_len = decimal_arg(expr, "malloc(")
            .ok_or_else(|| ChannelError::Evaluation("malformed batch block".into()))?;
        let offsets_len = (handles.len() + 1) * 4;
        let capacity = buffer_len.saturating_sub(offsets_len);

        let fail_names = self.fail_names.borrow();
        let mut st = self.state.borrow_mut();
        let mut buf = vec![0u8; buffer_len];
        let mut cursor = 0usize;
        for (i, handle) in handles.iter().enumerate() {
            let resolved: Option<String> = match call {
                "class_getName" => {
                    if fail_names.contains(handle) {
                        None
                    } else {
                        st.by_handle.get(handle).map(|c| c.name.clone())
                    }
                }
                _ => st.by_handle.get(handle).and_then(|c| c.image.clone()),
            };
            let slot = &mut buf[i * 4..i * 4 + 4];
            match resolved {
                Some(s) if cursor + s.len() + 1 <= capacity => {
                    LE::write_u32(slot, cursor as u32);
                    let start = offsets_len + cursor;
                    buf[start..start + s.len()].copy_from_slice(s.as_bytes());
                    cursor += s.len() + 1;
                }
                _ => LE::write_u32(slot, OFFSET_UNRESOLVED),
            }
        }
        let total_slot = handles.len() * 4;
        LE::write_u32(&mut buf[total_slot..total_slot + 4], cursor as u32);
        Ok(Value::Pointer(st.alloc(buf)))
    }

    fn eval_superclass_batch(&self, expr: &str) -> Result<Value, ChannelError> {
        let handles = hex_args(expr, "class_getSuperclass((Class)0x");
        let buffer_len = decimal_arg(expr, "malloc(")
            .ok_or_else(|| ChannelError::Evaluation("malformed batch block".into()))?;
        let offsets_len = (handles.len() + 1) * 4;
        let capacity = buffer_len.saturating_sub(offsets_len);
        let width = self.pointer_width;

        let mut st = self.state.borrow_mut();
        let mut buf = vec![0u8; buffer_len];
        let mut cursor = 0usize;
        for (i, handle) in handles.iter().enumerate() {
            let parent = st.by_handle.get(handle).map(|c| c.parent).unwrap_or(0);
            let parent_name = st
                .by_handle
                .get(&parent)
                .map(|c| c.name.clone())
                .filter(|_| parent != 0);
            let slot = &mut buf[i * 4..i * 4 + 4];
            match parent_name {
                Some(name) if cursor + width + name.len() + 1 <= capacity => {
                    LE::write_u32(slot, cursor as u32);
                    let start = offsets_len + cursor;
                    let mut word = [0u8; 8];
                    LE::write_u64(&mut word, parent);
                    buf[start..start + width].copy_from_slice(&word[..width]);
                    buf[start + width..start + width + name.len()]
                        .copy_from_slice(name.as_bytes());
                    cursor += width + name.len() + 1;
                }
                _ => LE::write_u32(slot, OFFSET_UNRESOLVED),
            }
        }
        let total_slot = handles.len() * 4;
        LE::write_u32(&mut buf[total_slot..total_slot + 4], cursor as u32);
        Ok(Value::Pointer(st.alloc(buf)))
    }

    fn eval_single_name(&self, expr: &str) -> Result<Value, ChannelError> {
        let handle = hex_args(expr, "class_getName((Class)0x")
            .first()
            .copied()
            .ok_or_else(|| ChannelError::Evaluation("malformed class_getName".into()))?;
        if self.fail_names.borrow().contains(&handle) {
            return Err(ChannelError::Evaluation("name lookup failed".into()));
        }
        let st = self.state.borrow();
        match st.by_handle.get(&handle) {
            Some(class) => Ok(Value::Str(class.name.clone())),
            None => Err(ChannelError::Evaluation("no such class".into())),
        }
    }

    fn eval_single_superclass(&self, expr: &str) -> Result<Value, ChannelError> {
        let handle = hex_args(expr, "class_getSuperclass((Class)0x")
            .first()
            .copied()
            .ok_or_else(|| ChannelError::Evaluation("malformed class_getSuperclass".into()))?;
        let st = self.state.borrow();
        Ok(Value::Pointer(
            st.by_handle.get(&handle).map(|c| c.parent).unwrap_or(0),
        ))
    }
}

impl TargetChannel for MockChannel {
    fn evaluate(&self, expr: &str) -> Result<Value, ChannelError> {
        if self.unavailable.get() {
            return Err(ChannelError::Unavailable);
        }
        let n = self.evaluations.get() + 1;
        self.evaluations.set(n);
        if let Some((nth, token)) = &*self.cancel_after.borrow() {
            if n >= *nth {
                token.cancel();
            }
        }
        if let Some(limit) = self.max_expr_len.get() {
            if expr.len() > limit {
                return Err(ChannelError::Evaluation(format!(
                    "expression exceeds {limit} byte limit"
                )));
            }
        }

        // Scratch released in a prelude or a dedicated free block.
        {
            let mut st = self.state.borrow_mut();
            for addr in hex_args(expr, "free((void *)0x") {
                st.blocks.remove(&addr);
            }
        }

        if expr.contains("objc_copyClassList") {
            self.log("copy_list");
            self.eval_copy_class_list()
        } else if expr.contains("objc_getClass(\"") {
            self.log("fast_path");
            self.eval_fast_path(expr)
        } else if expr.contains("class_getImageName((Class)0x") {
            self.log("batch_image");
            self.eval_string_batch(expr, "class_getImageName")
        } else if expr.starts_with("(Class)class_getSuperclass") {
            self.log("single_super");
            self.eval_single_superclass(expr)
        } else if expr.contains("class_getSuperclass((Class)0x") {
            self.log("batch_super");
            self.eval_superclass_batch(expr)
        } else if expr.starts_with("(const char *)class_getName") {
            self.log("single_name");
            self.eval_single_name(expr)
        } else if expr.contains("class_getName((Class)0x") {
            self.log("batch_names");
            self.eval_string_batch(expr, "class_getName")
        } else if expr.starts_with("(void)") {
            self.log("release");
            Ok(Value::Pointer(0))
        } else {
            Err(ChannelError::Evaluation(format!(
                "unrecognized expression: {}",
                &expr[..expr.len().min(60)]
            )))
        }
    }

    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, ChannelError> {
        if self.unavailable.get() {
            return Err(ChannelError::Unavailable);
        }
        self.reads.set(self.reads.get() + 1);
        let st = self.state.borrow();
        for (base, data) in &st.blocks {
            if address >= *base && address < base + data.len() as u64 {
                let offset = (address - base) as usize;
                let take = length.min(data.len() - offset);
                return Ok(data[offset..offset + take].to_vec());
            }
        }
        Err(ChannelError::Read {
            address,
            length,
            reason: "address not mapped".into(),
        })
    }

    fn pointer_width(&self) -> usize {
        self.pointer_width
    }

    fn byte_order(&self) -> ByteOrdering {
        ByteOrdering::Little
    }

    fn session(&self) -> ProcessSession {
        ProcessSession::new(self.pid, self.generation.get())
    }
}

/// Extract every hex number that directly follows `pat` in `expr`.
fn hex_args(expr: &str, pat: &str) -> Vec<u64> {
    let mut out = Vec::new();
    let mut rest = expr;
    while let Some(pos) = rest.find(pat) {
        let tail = &rest[pos + pat.len()..];
        let end = tail
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(tail.len());
        if let Ok(value) = u64::from_str_radix(&tail[..end], 16) {
            out.push(value);
        }
        rest = &tail[end..];
    }
    out
}

/// Extract the decimal number that directly follows the first `pat`.
fn decimal_arg(expr: &str, pat: &str) -> Option<usize> {
    let pos = expr.find(pat)?;
    let tail = &expr[pos + pat.len()..];
    let end = tail
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tail.len());
    tail[..end].parse().ok()
}

/// Extract the double-quoted argument that follows `pat`.
fn quoted_arg(expr: &str, pat: &str) -> Option<String> {
    let pos = expr.find(pat)?;
    let tail = &expr[pos + pat.len()..];
    let end = tail.find('"')?;
    Some(tail[..end].to_string())
}
