//! Module runtimes: how a compiled pipeline is instantiated and driven
//!
//! A runtime turns a fetched binary into a [`ModuleInstance`], the only view
//! the rest of the crate has of a module's linear memory. Addresses are
//! wrapped in [`MemoryHandle`] and never leave the codec/executor layer.

pub mod native;
pub mod wasi;

use crate::error::{BridgeError, CodecError};
use std::path::Path;

pub use self::native::{NativeContext, NativePipeline, NativeRuntime};
pub use self::wasi::WasmtimeRuntime;

/// Opaque address inside a module's linear memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(u32);

impl MemoryHandle {
    pub(crate) const fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub(crate) const fn offset(self) -> u32 {
        self.0
    }
}

/// Which buffer of an input/output slot an allocation or query refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    /// The JSON metadata blob of the slot
    Json,

    /// The n-th raw array of the slot (pixel data, direction, points, ...)
    Array(u32),
}

/// A native fault raised while the module was running
#[derive(Debug, Clone)]
pub struct InvocationFault {
    pub message: String,
}

impl std::fmt::Display for InvocationFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A live, instantiated pipeline module
///
/// One invocation is `prepare` → `alloc`/`write` inputs → `invoke` →
/// `output`/`read` outputs → `release`. Callers serialize invocations; the
/// instance itself is not reentrant.
pub trait ModuleInstance: Send {
    /// Start a fresh invocation with `argv`, emptying captured stdout/stderr
    fn prepare(&mut self, argv: &[String]) -> Result<(), CodecError>;

    /// Reserve `len` bytes for buffer `slot` of input `index`
    fn alloc(&mut self, index: usize, slot: BufferSlot, len: usize)
        -> Result<MemoryHandle, CodecError>;

    fn write(&mut self, handle: MemoryHandle, bytes: &[u8]) -> Result<(), CodecError>;

    /// Copy `len` bytes out of linear memory into a new buffer
    fn read(&mut self, handle: MemoryHandle, len: usize) -> Result<Vec<u8>, CodecError>;

    /// Address and byte length of buffer `slot` of output `index`
    fn output(&mut self, index: usize, slot: BufferSlot)
        -> Result<(MemoryHandle, usize), CodecError>;

    /// Run the entry point, returning its exit code
    fn invoke(&mut self) -> Result<i32, InvocationFault>;

    /// Finish the invocation, freeing everything allocated since `prepare`
    fn release(&mut self, return_code: i32);

    fn stdout(&self) -> String;

    fn stderr(&self) -> String;

    /// Host directory backing the module's virtual filesystem
    fn filesystem(&self) -> &Path;
}

/// Instantiates fetched module binaries
pub trait ModuleRuntime: Send + Sync {
    /// `name` is the module's entry point name (trailing path segment)
    fn instantiate(&self, name: &str, binary: &[u8]) -> Result<Box<dyn ModuleInstance>, BridgeError>;
}
