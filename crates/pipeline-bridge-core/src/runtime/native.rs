//! In-process pipelines
//!
//! A [`NativeRuntime`] maps module names to Rust callables and drives them
//! through the same [`ModuleInstance`] protocol as compiled modules: inputs
//! are copied into a private linear memory, the callable runs against a
//! [`NativeContext`], and outputs are read back by address. Useful for
//! embedding hosts without a WebAssembly engine, and for tests.

use super::{BufferSlot, InvocationFault, MemoryHandle, ModuleInstance, ModuleRuntime};
use crate::codec::address_reference;
use crate::error::{BridgeError, CodecError};
use crate::vfs::VirtualFs;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tempfile::TempDir;
use tracing::debug;

/// First usable offset; 0 stays reserved as the null address
const HEAP_BASE: usize = 8;
const ALIGN: usize = 8;

/// A pipeline implemented in Rust
///
/// `Ok(rc)` is the module's exit code; `Err` is a fault, the equivalent of a
/// trap in a compiled module.
pub trait NativePipeline: Send + Sync {
    fn run(&self, ctx: &mut NativeContext<'_>) -> Result<i32, String>;
}

impl<F> NativePipeline for F
where
    F: Fn(&mut NativeContext<'_>) -> Result<i32, String> + Send + Sync,
{
    fn run(&self, ctx: &mut NativeContext<'_>) -> Result<i32, String> {
        self(ctx)
    }
}

/// Registry of native pipelines keyed by module name
#[derive(Clone, Default)]
pub struct NativeRuntime {
    pipelines: Arc<RwLock<HashMap<String, Arc<dyn NativePipeline>>>>,
    instantiations: Arc<AtomicUsize>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the pipeline answering to `name`
    pub fn register(&self, name: impl Into<String>, pipeline: impl NativePipeline + 'static) {
        let name = name.into();
        debug!("Registered native pipeline: {}", name);
        self.pipelines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, Arc::new(pipeline));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    /// Number of instances created so far
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

impl ModuleRuntime for NativeRuntime {
    fn instantiate(
        &self,
        name: &str,
        _binary: &[u8],
    ) -> Result<Box<dyn ModuleInstance>, BridgeError> {
        let pipeline = self
            .pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::module_load(name, "no native pipeline registered"))?;

        let sandbox = tempfile::Builder::new()
            .prefix("pipeline-bridge-")
            .tempdir()
            .map_err(|e| BridgeError::module_load(name, e))?;

        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NativeInstance {
            name: name.to_string(),
            pipeline,
            memory: Vec::new(),
            next: HEAP_BASE,
            argv: Vec::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            sandbox,
        }))
    }
}

struct NativeInstance {
    name: String,
    pipeline: Arc<dyn NativePipeline>,
    memory: Vec<u8>,
    next: usize,
    argv: Vec<String>,
    inputs: HashMap<(usize, BufferSlot), (MemoryHandle, usize)>,
    outputs: HashMap<(usize, BufferSlot), (MemoryHandle, usize)>,
    stdout: String,
    stderr: String,
    sandbox: TempDir,
}

impl NativeInstance {
    fn allocate(&mut self, len: usize) -> Result<MemoryHandle, CodecError> {
        let offset = self.next.next_multiple_of(ALIGN);
        let end = offset + len;
        let handle = u32::try_from(offset)
            .ok()
            .filter(|_| u32::try_from(end).is_ok())
            .map(MemoryHandle::new)
            .ok_or(CodecError::MemoryAccess {
                offset: offset as u64,
                len,
            })?;
        if self.memory.len() < end {
            self.memory.resize(end, 0);
        }
        self.next = end;
        Ok(handle)
    }

    fn range(&self, handle: MemoryHandle, len: usize) -> Result<std::ops::Range<usize>, CodecError> {
        let start = handle.offset() as usize;
        let end = start + len;
        if end > self.memory.len() {
            return Err(CodecError::MemoryAccess {
                offset: start as u64,
                len,
            });
        }
        Ok(start..end)
    }

    fn slot_bytes(
        &self,
        slots: &HashMap<(usize, BufferSlot), (MemoryHandle, usize)>,
        key: (usize, BufferSlot),
    ) -> Option<&[u8]> {
        let (handle, len) = *slots.get(&key)?;
        let range = self.range(handle, len).ok()?;
        Some(&self.memory[range])
    }
}

impl ModuleInstance for NativeInstance {
    fn prepare(&mut self, argv: &[String]) -> Result<(), CodecError> {
        self.argv = argv.to_vec();
        self.stdout.clear();
        self.stderr.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.next = HEAP_BASE;
        Ok(())
    }

    fn alloc(
        &mut self,
        index: usize,
        slot: BufferSlot,
        len: usize,
    ) -> Result<MemoryHandle, CodecError> {
        let handle = self.allocate(len)?;
        self.inputs.insert((index, slot), (handle, len));
        Ok(handle)
    }

    fn write(&mut self, handle: MemoryHandle, bytes: &[u8]) -> Result<(), CodecError> {
        let range = self.range(handle, bytes.len())?;
        self.memory[range].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, handle: MemoryHandle, len: usize) -> Result<Vec<u8>, CodecError> {
        let range = self.range(handle, len)?;
        Ok(self.memory[range].to_vec())
    }

    fn output(
        &mut self,
        index: usize,
        slot: BufferSlot,
    ) -> Result<(MemoryHandle, usize), CodecError> {
        match (self.outputs.get(&(index, slot)), slot) {
            (Some(&found), _) => Ok(found),
            (None, BufferSlot::Array(_)) => Ok((MemoryHandle::new(0), 0)),
            (None, BufferSlot::Json) => Err(CodecError::InvalidBuffer(format!(
                "{} produced no output {}",
                self.name, index
            ))),
        }
    }

    fn invoke(&mut self) -> Result<i32, InvocationFault> {
        let pipeline = Arc::clone(&self.pipeline);
        let mut ctx = NativeContext { state: self };
        match std::panic::catch_unwind(AssertUnwindSafe(|| pipeline.run(&mut ctx))) {
            Ok(Ok(return_code)) => Ok(return_code),
            Ok(Err(message)) => Err(InvocationFault { message }),
            Err(payload) => Err(InvocationFault {
                message: panic_message(payload),
            }),
        }
    }

    fn release(&mut self, _return_code: i32) {
        self.inputs.clear();
        self.outputs.clear();
        self.next = HEAP_BASE;
    }

    fn stdout(&self) -> String {
        self.stdout.clone()
    }

    fn stderr(&self) -> String {
        self.stderr.clone()
    }

    fn filesystem(&self) -> &Path {
        self.sandbox.path()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "native pipeline panicked".to_string()
}

/// What a native pipeline sees while it runs
pub struct NativeContext<'a> {
    state: &'a mut NativeInstance,
}

impl NativeContext<'_> {
    pub fn argv(&self) -> &[String] {
        &self.state.argv
    }

    /// JSON metadata of input `index`
    pub fn input_json(&self, index: usize) -> Result<Value, String> {
        let bytes = self
            .state
            .slot_bytes(&self.state.inputs, (index, BufferSlot::Json))
            .ok_or_else(|| format!("input {index} has no JSON metadata"))?;
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }

    /// Raw array `sub` of input `index`
    pub fn input_array(&self, index: usize, sub: u32) -> Result<Vec<u8>, String> {
        self.state
            .slot_bytes(&self.state.inputs, (index, BufferSlot::Array(sub)))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| format!("input {index} has no array {sub}"))
    }

    /// Contents of a text stream input
    pub fn input_text(&self, index: usize) -> Result<String, String> {
        String::from_utf8(self.input_array(index, 0)?).map_err(|e| e.to_string())
    }

    /// Copy `bytes` into memory as array `sub` of output `index`; returns its address reference
    pub fn set_output_array(
        &mut self,
        index: usize,
        sub: u32,
        bytes: &[u8],
    ) -> Result<String, String> {
        self.store_output((index, BufferSlot::Array(sub)), bytes)
            .map(address_reference)
            .map_err(|e| e.to_string())
    }

    pub fn set_output_json(&mut self, index: usize, value: &Value) -> Result<(), String> {
        let bytes = serde_json::to_vec(value).map_err(|e| e.to_string())?;
        self.store_output((index, BufferSlot::Json), &bytes)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Set a stream output (text or binary)
    pub fn set_output_bytes(&mut self, index: usize, bytes: &[u8]) -> Result<(), String> {
        let data = self.set_output_array(index, 0, bytes)?;
        self.set_output_json(
            index,
            &serde_json::json!({ "size": bytes.len(), "data": data }),
        )
    }

    pub fn set_output_text(&mut self, index: usize, text: &str) -> Result<(), String> {
        self.set_output_bytes(index, text.as_bytes())
    }

    pub fn print(&mut self, text: &str) {
        self.state.stdout.push_str(text);
        self.state.stdout.push('\n');
    }

    pub fn eprint(&mut self, text: &str) {
        self.state.stderr.push_str(text);
        self.state.stderr.push('\n');
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, String> {
        VirtualFs::new(self.state.sandbox.path())
            .read(path)
            .map_err(|e| e.to_string())
    }

    pub fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), String> {
        VirtualFs::new(self.state.sandbox.path())
            .write(path, bytes)
            .map_err(|e| e.to_string())
    }

    fn store_output(
        &mut self,
        key: (usize, BufferSlot),
        bytes: &[u8],
    ) -> Result<MemoryHandle, CodecError> {
        let handle = self.state.allocate(bytes.len())?;
        self.state.write(handle, bytes)?;
        self.state.outputs.insert(key, (handle, bytes.len()));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unknown_pipeline_is_load_error() {
        let runtime = NativeRuntime::new();
        let err = runtime.instantiate("missing", &[]).err().unwrap();
        assert!(matches!(err, BridgeError::ModuleLoad { .. }));
        assert_eq!(runtime.instantiations(), 0);
    }

    #[test]
    fn test_stream_roundtrip_through_memory() {
        let runtime = NativeRuntime::new();
        runtime.register("upper", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            let text = ctx.input_text(0)?;
            ctx.set_output_text(0, &text.to_uppercase())?;
            ctx.print(&format!("argv={}", ctx.argv().join(" ")));
            Ok(0)
        });
        let mut instance = runtime.instantiate("upper", &[]).unwrap();
        instance.prepare(&argv(&["upper", "0", "0"])).unwrap();

        let handle = instance.alloc(0, BufferSlot::Array(0), 5).unwrap();
        instance.write(handle, b"hello").unwrap();
        assert_eq!(instance.invoke().unwrap(), 0);

        let (out, len) = instance.output(0, BufferSlot::Array(0)).unwrap();
        assert_eq!(instance.read(out, len).unwrap(), b"HELLO");
        assert_eq!(instance.stdout(), "argv=upper 0 0\n");
        assert_eq!(runtime.instantiations(), 1);
    }

    #[test]
    fn test_allocations_are_aligned_and_nonzero() {
        let runtime = NativeRuntime::new();
        runtime.register("noop", |_: &mut NativeContext<'_>| Ok(0));
        let mut instance = runtime.instantiate("noop", &[]).unwrap();
        instance.prepare(&[]).unwrap();

        let a = instance.alloc(0, BufferSlot::Array(0), 3).unwrap();
        let b = instance.alloc(0, BufferSlot::Array(1), 0).unwrap();
        let c = instance.alloc(0, BufferSlot::Json, 4).unwrap();
        assert_ne!(a.offset(), 0);
        assert_eq!(b.offset() % 8, 0);
        assert!(c.offset() >= a.offset() + 3);
    }

    #[test]
    fn test_out_of_bounds_read() {
        let runtime = NativeRuntime::new();
        runtime.register("noop", |_: &mut NativeContext<'_>| Ok(0));
        let mut instance = runtime.instantiate("noop", &[]).unwrap();
        instance.prepare(&[]).unwrap();

        let err = instance.read(MemoryHandle::new(1024), 16).unwrap_err();
        assert!(matches!(err, CodecError::MemoryAccess { offset: 1024, len: 16 }));
    }

    #[test]
    fn test_panic_becomes_fault() {
        let runtime = NativeRuntime::new();
        runtime.register("boom", |_: &mut NativeContext<'_>| -> Result<i32, String> {
            panic!("index out of range")
        });
        let mut instance = runtime.instantiate("boom", &[]).unwrap();
        instance.prepare(&[]).unwrap();

        let fault = instance.invoke().unwrap_err();
        assert!(fault.message.contains("index out of range"));
    }

    #[test]
    fn test_prepare_resets_stdio() {
        let runtime = NativeRuntime::new();
        runtime.register("chatty", |ctx: &mut NativeContext<'_>| {
            ctx.print("out");
            ctx.eprint("err");
            Ok(1)
        });
        let mut instance = runtime.instantiate("chatty", &[]).unwrap();
        instance.prepare(&[]).unwrap();
        assert_eq!(instance.invoke().unwrap(), 1);
        instance.release(1);
        instance.prepare(&[]).unwrap();
        assert_eq!(instance.stdout(), "");
        assert_eq!(instance.stderr(), "");
    }

    #[test]
    fn test_output_allocation_failure_is_reported() {
        let runtime = NativeRuntime::new();
        runtime.register("oversized", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            // Past the end of the 32-bit address space
            ctx.state.next = u32::MAX as usize;
            ctx.set_output_array(0, 0, &[1, 2, 3, 4])?;
            Ok(0)
        });
        let mut instance = runtime.instantiate("oversized", &[]).unwrap();
        instance.prepare(&[]).unwrap();

        let fault = instance.invoke().unwrap_err();
        assert!(fault.message.contains("out of bounds"), "{}", fault.message);
        assert_eq!(instance.output(0, BufferSlot::Array(0)).unwrap().1, 0);
    }
}
