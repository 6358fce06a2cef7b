//! WebAssembly runtime backed by wasmtime + WASI preview 1
//!
//! Modules follow the memory-io ABI: the host asks the module to allocate
//! input buffers (`itk_wasm_input_*_alloc`), copies bytes in, runs the entry
//! point, then asks for output addresses and sizes. Modules built with a
//! delayed start export `itk_wasm_delayed_start`/`itk_wasm_delayed_exit` so
//! the host can read outputs before the module frees them; plain command
//! modules only export `_start`.
//!
//! WASI arguments are fixed when the context is built, so every invocation
//! gets a fresh store and instance of the compiled module. The sandbox
//! directory preopened at `/` lives as long as the module handle.

use super::{BufferSlot, InvocationFault, MemoryHandle, ModuleInstance, ModuleRuntime};
use crate::error::{BridgeError, CodecError};
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, warn};
use wasmtime::{Engine, Instance, Linker, Memory, Module, Store, WasmParams, WasmResults};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

/// Default capture limit for each of stdout and stderr
pub const DEFAULT_STDIO_CAPACITY: usize = 16 * 1024 * 1024;

const INPUT_ARRAY_ALLOC: &str = "itk_wasm_input_array_alloc";
const INPUT_JSON_ALLOC: &str = "itk_wasm_input_json_alloc";
const OUTPUT_ARRAY_ADDRESS: &str = "itk_wasm_output_array_address";
const OUTPUT_ARRAY_SIZE: &str = "itk_wasm_output_array_size";
const OUTPUT_JSON_ADDRESS: &str = "itk_wasm_output_json_address";
const OUTPUT_JSON_SIZE: &str = "itk_wasm_output_json_size";
const DELAYED_START: &str = "itk_wasm_delayed_start";
const DELAYED_EXIT: &str = "itk_wasm_delayed_exit";

/// Compiles and instantiates WebAssembly pipeline modules
#[derive(Clone)]
pub struct WasmtimeRuntime {
    engine: Engine,
    stdio_capacity: usize,
}

impl WasmtimeRuntime {
    pub fn new() -> Self {
        Self::with_stdio_capacity(DEFAULT_STDIO_CAPACITY)
    }

    pub fn with_stdio_capacity(stdio_capacity: usize) -> Self {
        Self {
            engine: Engine::default(),
            stdio_capacity,
        }
    }
}

impl Default for WasmtimeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRuntime for WasmtimeRuntime {
    fn instantiate(
        &self,
        name: &str,
        binary: &[u8],
    ) -> Result<Box<dyn ModuleInstance>, BridgeError> {
        let module =
            Module::new(&self.engine, binary).map_err(|e| BridgeError::module_load(name, e))?;
        if !module.exports().any(|export| export.name() == "memory") {
            return Err(BridgeError::module_load(name, "module does not export memory"));
        }

        let sandbox = tempfile::Builder::new()
            .prefix("pipeline-bridge-")
            .tempdir()
            .map_err(|e| BridgeError::module_load(name, e))?;

        debug!("Compiled module {} ({} bytes)", name, binary.len());
        Ok(Box::new(WasiInstance {
            name: name.to_string(),
            engine: self.engine.clone(),
            module,
            stdio_capacity: self.stdio_capacity,
            sandbox,
            live: None,
        }))
    }
}

struct WasiInstance {
    name: String,
    engine: Engine,
    module: Module,
    stdio_capacity: usize,
    sandbox: TempDir,
    live: Option<Live>,
}

/// One instantiation of the module, valid from `prepare` to the next `prepare`
struct Live {
    store: Store<WasiP1Ctx>,
    instance: Instance,
    memory: Memory,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    delayed: bool,
}

impl Live {
    fn call<P, R>(&mut self, name: &str, params: P) -> Result<R, CodecError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|_| CodecError::MissingExport(name.to_string()))?;
        func.call(&mut self.store, params)
            .map_err(|e| CodecError::Call(format!("{name}: {e}")))
    }
}

impl WasiInstance {
    fn live(&mut self) -> Result<&mut Live, CodecError> {
        self.live
            .as_mut()
            .ok_or_else(|| CodecError::Call(format!("{} has not been prepared", self.name)))
    }

    fn instantiate(&self, argv: &[String]) -> anyhow::Result<Live> {
        let stdout = MemoryOutputPipe::new(self.stdio_capacity);
        let stderr = MemoryOutputPipe::new(self.stdio_capacity);

        let mut builder = WasiCtxBuilder::new();
        builder
            .args(argv)
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .preopened_dir(self.sandbox.path(), "/", DirPerms::all(), FilePerms::all())?;
        let ctx = builder.build_p1();

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |ctx| ctx)?;

        let mut store = Store::new(&self.engine, ctx);
        let instance = linker.instantiate(&mut store, &self.module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow::anyhow!("module does not export memory"))?;
        let delayed = instance.get_func(&mut store, DELAYED_START).is_some();

        let mut live = Live {
            store,
            instance,
            memory,
            stdout,
            stderr,
            delayed,
        };
        if live.instance.get_func(&mut live.store, "_initialize").is_some() {
            live.call::<(), ()>("_initialize", ())?;
        }
        Ok(live)
    }
}

fn exit_code(err: &anyhow::Error) -> Option<i32> {
    err.downcast_ref::<I32Exit>().map(|exit| exit.0)
}

impl ModuleInstance for WasiInstance {
    fn prepare(&mut self, argv: &[String]) -> Result<(), CodecError> {
        self.live = None;
        let live = self
            .instantiate(argv)
            .map_err(|e| CodecError::Call(format!("instantiating {}: {e:#}", self.name)))?;
        self.live = Some(live);
        Ok(())
    }

    fn alloc(
        &mut self,
        index: usize,
        slot: BufferSlot,
        len: usize,
    ) -> Result<MemoryHandle, CodecError> {
        let live = self.live()?;
        let address: i32 = match slot {
            BufferSlot::Json => live.call(INPUT_JSON_ALLOC, (0i32, index as i32, len as i32))?,
            BufferSlot::Array(sub) => live.call(
                INPUT_ARRAY_ALLOC,
                (0i32, index as i32, sub as i32, len as i32),
            )?,
        };
        Ok(MemoryHandle::new(address as u32))
    }

    fn write(&mut self, handle: MemoryHandle, bytes: &[u8]) -> Result<(), CodecError> {
        let live = self.live()?;
        live.memory
            .write(&mut live.store, handle.offset() as usize, bytes)
            .map_err(|_| CodecError::MemoryAccess {
                offset: handle.offset() as u64,
                len: bytes.len(),
            })
    }

    fn read(&mut self, handle: MemoryHandle, len: usize) -> Result<Vec<u8>, CodecError> {
        let live = self.live()?;
        let mut buffer = vec![0u8; len];
        live.memory
            .read(&live.store, handle.offset() as usize, &mut buffer)
            .map_err(|_| CodecError::MemoryAccess {
                offset: handle.offset() as u64,
                len,
            })?;
        Ok(buffer)
    }

    fn output(
        &mut self,
        index: usize,
        slot: BufferSlot,
    ) -> Result<(MemoryHandle, usize), CodecError> {
        let live = self.live()?;
        let (address, size): (i32, i32) = match slot {
            BufferSlot::Json => (
                live.call(OUTPUT_JSON_ADDRESS, (0i32, index as i32))?,
                live.call(OUTPUT_JSON_SIZE, (0i32, index as i32))?,
            ),
            BufferSlot::Array(sub) => (
                live.call(OUTPUT_ARRAY_ADDRESS, (0i32, index as i32, sub as i32))?,
                live.call(OUTPUT_ARRAY_SIZE, (0i32, index as i32, sub as i32))?,
            ),
        };
        Ok((MemoryHandle::new(address as u32), size.max(0) as usize))
    }

    fn invoke(&mut self) -> Result<i32, InvocationFault> {
        let live = self.live().map_err(|e| InvocationFault {
            message: e.to_string(),
        })?;

        let result = if live.delayed {
            live.instance
                .get_typed_func::<(), i32>(&mut live.store, DELAYED_START)
                .and_then(|start| start.call(&mut live.store, ()))
        } else {
            live.instance
                .get_typed_func::<(), ()>(&mut live.store, "_start")
                .and_then(|start| start.call(&mut live.store, ()))
                .map(|()| 0)
        };

        match result {
            Ok(return_code) => Ok(return_code),
            Err(err) => match exit_code(&err) {
                Some(return_code) => Ok(return_code),
                None => Err(InvocationFault {
                    message: format!("{err:#}"),
                }),
            },
        }
    }

    fn release(&mut self, return_code: i32) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if !live.delayed {
            return;
        }
        // The delayed exit ends in proc_exit, which surfaces as an I32Exit error
        let result = live
            .instance
            .get_typed_func::<i32, ()>(&mut live.store, DELAYED_EXIT)
            .and_then(|exit| exit.call(&mut live.store, return_code));
        if let Err(err) = result {
            if exit_code(&err).is_none() {
                warn!("Releasing memory of {} failed: {:#}", self.name, err);
            }
        }
    }

    fn stdout(&self) -> String {
        self.live
            .as_ref()
            .map(|live| String::from_utf8_lossy(&live.stdout.contents()).into_owned())
            .unwrap_or_default()
    }

    fn stderr(&self) -> String {
        self.live
            .as_ref()
            .map(|live| String::from_utf8_lossy(&live.stderr.contents()).into_owned())
            .unwrap_or_default()
    }

    fn filesystem(&self) -> &Path {
        self.sandbox.path()
    }
}
