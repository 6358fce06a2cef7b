//! Pipeline Bridge Core - loads compiled pipeline modules and drives them
//!
//! This crate loads WebAssembly pipeline modules, marshals images, meshes,
//! poly data and streams into and out of their linear memory, and picks the
//! right IO backend for a file by mime type, extension or trial execution.
//!
//! ```no_run
//! use pipeline_bridge_core::{BridgeConfig, Operation, PipelineBridge, PipelineRequest};
//!
//! # async fn demo() -> pipeline_bridge_core::Result<()> {
//! let bridge = PipelineBridge::new(BridgeConfig::from_env())?;
//! let mut request = PipelineRequest::new(Operation::RunPipeline);
//! request.pipeline_path = Some("median-filter".to_string());
//! let response = bridge.handle(request).await?;
//! println!("{}", response.stdout);
//! # Ok(())
//! # }
//! ```

pub mod bindings;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod loader;
pub mod operation;
pub mod resolver;
pub mod runtime;
pub mod transfer;
pub mod types;
pub mod vfs;

pub use bindings::{Domain, IoBindings, IMAGE_IO, MESH_IO};
pub use bridge::{BridgeResponse, PipelineBridge, PipelineRequest};
pub use config::{BridgeConfig, RequestConfig};
pub use error::{BridgeError, CodecError, Result};
pub use executor::ExecutionResult;
pub use loader::{CacheStats, HttpFetcher, ModuleCache, ModuleFetcher, PipelineModule};
pub use operation::Operation;
pub use resolver::{Resolution, TrialOutcome};
pub use runtime::{
    ModuleInstance, ModuleRuntime, NativeContext, NativePipeline, NativeRuntime, WasmtimeRuntime,
};
pub use transfer::collect_transferable;
pub use types::{
    BinaryFile, BinaryStream, BufferStorage, DataDescriptor, ElementType, Image, ImageType, Mesh,
    MeshType, OutputSpec, PipelineInput, PixelType, PolyData, PolyDataType, TextFile, TextStream,
    TypedBuffer,
};
