//! Front controller: one request in, one response envelope out
//!
//! Read and write operations pick their backend through the format resolver;
//! the conversion and DICOM operations use fixed modules. Every operation
//! ends in a single execution whose result becomes the response.

use crate::bindings::Domain;
use crate::config::{BridgeConfig, RequestConfig};
use crate::error::{BridgeError, CodecError, Result};
use crate::executor::{self, ExecutionResult};
use crate::loader::{HttpFetcher, ModuleCache, ModuleFetcher};
use crate::operation::Operation;
use crate::resolver::{self, Resolution, TrialOutcome};
use crate::runtime::{ModuleRuntime, WasmtimeRuntime};
use crate::transfer;
use crate::types::{DataDescriptor, OutputSpec, PipelineInput, DESCRIPTOR_TYPES};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const MESH_TO_POLY_DATA: &str = "mesh-to-polydata";
pub const POLY_DATA_TO_MESH: &str = "polydata-to-mesh";
pub const READ_DICOM_IMAGE_SERIES: &str = "read-image-dicom-file-series";
pub const READ_DICOM_TAGS: &str = "read-dicom-tags";

/// An operation call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    /// Operation name, parsed before anything runs
    pub operation: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_path: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub inputs: Vec<PipelineInput>,

    /// Expected output kinds only
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Overrides the module locations for this request only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RequestConfig>,
}

impl PipelineRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation: operation.as_str().to_string(),
            pipeline_path: None,
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            mime_type: None,
            file_name: None,
            config: None,
        }
    }

    /// Parse a request, reporting unrecognized descriptor tags as unsupported types
    pub fn from_json(value: Value) -> Result<Self> {
        for key in ["inputs", "outputs"] {
            let Some(Value::Array(entries)) = value.get(key) else {
                continue;
            };
            for entry in entries {
                let kind = entry.get("type").and_then(Value::as_str).unwrap_or_default();
                if !DESCRIPTOR_TYPES.contains(&kind) {
                    return Err(CodecError::UnsupportedType(format!(
                        "descriptor type '{kind}' in {key}"
                    ))
                    .into());
                }
            }
        }
        serde_json::from_value(value).map_err(|e| BridgeError::InvalidRequest(e.to_string()))
    }
}

/// Response envelope
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub return_value: i32,
    pub stdout: String,
    pub stderr: String,
    pub outputs: Vec<DataDescriptor>,

    /// Output buffers that can be moved to the caller without copying
    #[serde(skip)]
    pub transferables: Vec<Arc<[u8]>>,
}

impl From<ExecutionResult> for BridgeResponse {
    fn from(result: ExecutionResult) -> Self {
        let transferables = transfer::collect_transferable(&result);
        Self {
            return_value: result.return_value,
            stdout: result.stdout,
            stderr: result.stderr,
            outputs: result.outputs,
            transferables,
        }
    }
}

/// Loads, resolves and runs pipeline modules on behalf of one caller
pub struct PipelineBridge {
    config: BridgeConfig,
    cache: ModuleCache,
}

impl PipelineBridge {
    /// Bridge fetching over HTTP/filesystem and running modules in wasmtime
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(HttpFetcher::new(config.max_module_bytes)?);
        let runtime = Arc::new(WasmtimeRuntime::with_stdio_capacity(config.stdio_capacity));
        Ok(Self::with_runtime(config, fetcher, runtime))
    }

    pub fn with_runtime(
        config: BridgeConfig,
        fetcher: Arc<dyn ModuleFetcher>,
        runtime: Arc<dyn ModuleRuntime>,
    ) -> Self {
        Self {
            config,
            cache: ModuleCache::new(fetcher, runtime),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Parse and handle a JSON request
    pub async fn handle_json(&self, request: Value) -> Result<BridgeResponse> {
        self.handle(PipelineRequest::from_json(request)?).await
    }

    pub async fn handle(&self, request: PipelineRequest) -> Result<BridgeResponse> {
        let operation: Operation = request.operation.parse()?;
        let overridden;
        let config = match &request.config {
            Some(overrides) => {
                overridden = overrides.apply(&self.config)?;
                &overridden
            }
            None => &self.config,
        };
        info!("Handling {}", operation);

        let result = match operation {
            Operation::RunPipeline => self.run_pipeline(&request, config).await?,
            Operation::ReadImage => self.read(Domain::Image, &request, config).await?,
            Operation::ReadMesh => self.read(Domain::Mesh, &request, config).await?,
            Operation::WriteImage => self.write(Domain::Image, &request, config).await?,
            Operation::WriteMesh => self.write(Domain::Mesh, &request, config).await?,
            Operation::MeshToPolyData => {
                self.convert(MESH_TO_POLY_DATA, OutputSpec::poly_data(), &request, config)
                    .await?
            }
            Operation::PolyDataToMesh => {
                self.convert(POLY_DATA_TO_MESH, OutputSpec::mesh(), &request, config)
                    .await?
            }
            Operation::ReadDicomImageSeries => self.read_dicom_series(&request, config).await?,
            Operation::ReadDicomTags => self.read_dicom_tags(&request, config).await?,
        };
        Ok(BridgeResponse::from(result))
    }

    async fn run_pipeline(
        &self,
        request: &PipelineRequest,
        config: &BridgeConfig,
    ) -> Result<ExecutionResult> {
        let path = request.pipeline_path.as_deref().ok_or_else(|| {
            BridgeError::InvalidRequest("runPipeline requires a pipelinePath".to_string())
        })?;
        let module = self.cache.load(path, &config.pipelines_url).await?;
        executor::run(&module, &request.args, &request.outputs, &request.inputs).await
    }

    async fn read(
        &self,
        domain: Domain,
        request: &PipelineRequest,
        config: &BridgeConfig,
    ) -> Result<ExecutionResult> {
        let file_name = request
            .file_name
            .clone()
            .or_else(|| request.inputs.iter().find_map(file_path).map(str::to_string))
            .ok_or_else(|| missing(domain_operation(domain, "read"), "a fileName"))?;
        if request.inputs.is_empty() {
            return Err(missing(domain_operation(domain, "read"), "the file as input"));
        }

        let inputs = place_file(&request.inputs, &file_name);
        let args = args_or(&request.args, || {
            vec![
                file_name.clone(),
                "0".to_string(),
                "--memory-io".to_string(),
                "--quiet".to_string(),
            ]
        });
        let outputs = outputs_or(&request.outputs, || match domain {
            Domain::Image => OutputSpec::image(),
            Domain::Mesh => OutputSpec::mesh(),
        });

        self.resolve_and_run(
            domain,
            Domain::read_module,
            request.mime_type.as_deref(),
            &file_name,
            io_url(domain, config),
            &args,
            &outputs,
            &inputs,
        )
        .await
    }

    async fn write(
        &self,
        domain: Domain,
        request: &PipelineRequest,
        config: &BridgeConfig,
    ) -> Result<ExecutionResult> {
        let file_name = request
            .file_name
            .clone()
            .ok_or_else(|| missing(domain_operation(domain, "write"), "a fileName"))?;
        if request.inputs.is_empty() {
            return Err(missing(
                domain_operation(domain, "write"),
                &format!("the {domain} as input"),
            ));
        }

        let args = args_or(&request.args, || {
            vec![
                "0".to_string(),
                file_name.clone(),
                "--memory-io".to_string(),
                "--quiet".to_string(),
            ]
        });
        let outputs = outputs_or(&request.outputs, || OutputSpec::BinaryFile {
            path: file_name.clone(),
        });

        self.resolve_and_run(
            domain,
            Domain::write_module,
            request.mime_type.as_deref(),
            &file_name,
            io_url(domain, config),
            &args,
            &outputs,
            &request.inputs,
        )
        .await
    }

    /// Resolve the backend and run its module; an accepted trial run is the result
    #[allow(clippy::too_many_arguments)]
    async fn resolve_and_run(
        &self,
        domain: Domain,
        module_for: fn(Domain, &str) -> String,
        mime_type: Option<&str>,
        file_name: &str,
        io_url: &str,
        args: &[String],
        outputs: &[OutputSpec],
        inputs: &[PipelineInput],
    ) -> Result<ExecutionResult> {
        let resolution = resolver::resolve(domain, mime_type, file_name, |backend| {
            let module_name = module_for(domain, backend);
            async move {
                let result = match self.cache.load(&module_name, io_url).await {
                    Ok(module) => executor::run(&module, args, outputs, inputs).await,
                    Err(e) => Err(e),
                };
                TrialOutcome::from_execution(result)
            }
        })
        .await?;

        match resolution {
            Resolution::Trial { result, .. } => Ok(result),
            declared => {
                let module = self
                    .cache
                    .load(&module_for(domain, declared.backend()), io_url)
                    .await?;
                executor::run(&module, args, outputs, inputs).await
            }
        }
    }

    async fn convert(
        &self,
        module_name: &str,
        output: OutputSpec,
        request: &PipelineRequest,
        config: &BridgeConfig,
    ) -> Result<ExecutionResult> {
        if request.inputs.is_empty() {
            return Err(missing(&request.operation, "an input"));
        }
        let args = args_or(&request.args, || {
            vec!["0".to_string(), "0".to_string(), "--memory-io".to_string()]
        });
        let outputs = outputs_or(&request.outputs, || output.clone());
        let module = self.cache.load(module_name, &config.mesh_io_url).await?;
        executor::run(&module, &args, &outputs, &request.inputs).await
    }

    async fn read_dicom_series(
        &self,
        request: &PipelineRequest,
        config: &BridgeConfig,
    ) -> Result<ExecutionResult> {
        let paths: Vec<&str> = request.inputs.iter().filter_map(file_path).collect();
        if paths.is_empty() {
            return Err(missing(&request.operation, "one or more files"));
        }
        let args = args_or(&request.args, || {
            let mut args = vec!["--input-images".to_string()];
            args.extend(paths.iter().map(|p| p.to_string()));
            args.extend(
                ["--single-sorted-series", "0", "1", "--memory-io"]
                    .into_iter()
                    .map(str::to_string),
            );
            args
        });
        let outputs = if request.outputs.is_empty() {
            vec![OutputSpec::image(), OutputSpec::TextStream]
        } else {
            request.outputs.clone()
        };
        let module = self
            .cache
            .load(READ_DICOM_IMAGE_SERIES, &config.image_io_url)
            .await?;
        executor::run(&module, &args, &outputs, &request.inputs).await
    }

    async fn read_dicom_tags(
        &self,
        request: &PipelineRequest,
        config: &BridgeConfig,
    ) -> Result<ExecutionResult> {
        let path = request
            .inputs
            .iter()
            .find_map(file_path)
            .ok_or_else(|| missing(&request.operation, "a file"))?;
        let args = args_or(&request.args, || {
            vec![path.to_string(), "0".to_string(), "--memory-io".to_string()]
        });
        let outputs = outputs_or(&request.outputs, || OutputSpec::TextStream);
        let module = self.cache.load(READ_DICOM_TAGS, &config.image_io_url).await?;
        executor::run(&module, &args, &outputs, &request.inputs).await
    }
}

fn io_url(domain: Domain, config: &BridgeConfig) -> &str {
    match domain {
        Domain::Image => &config.image_io_url,
        Domain::Mesh => &config.mesh_io_url,
    }
}

fn domain_operation(domain: Domain, verb: &str) -> String {
    match domain {
        Domain::Image => format!("{verb}Image"),
        Domain::Mesh => format!("{verb}Mesh"),
    }
}

fn missing(operation: impl AsRef<str>, what: &str) -> BridgeError {
    BridgeError::InvalidRequest(format!("{} requires {}", operation.as_ref(), what))
}

fn file_path(input: &PipelineInput) -> Option<&str> {
    match &input.descriptor {
        DataDescriptor::BinaryFile(file) => Some(file.path.as_str()),
        DataDescriptor::TextFile(file) => Some(file.path.as_str()),
        _ => None,
    }
}

fn args_or(args: &[String], default: impl FnOnce() -> Vec<String>) -> Vec<String> {
    if args.is_empty() {
        default()
    } else {
        args.to_vec()
    }
}

fn outputs_or(outputs: &[OutputSpec], default: impl FnOnce() -> OutputSpec) -> Vec<OutputSpec> {
    if outputs.is_empty() {
        vec![default()]
    } else {
        outputs.to_vec()
    }
}

/// Inputs with the first file input relocated to `file_name` in the sandbox
fn place_file(inputs: &[PipelineInput], file_name: &str) -> Vec<PipelineInput> {
    let mut inputs = inputs.to_vec();
    if let Some(input) = inputs.iter_mut().find(|input| file_path(input).is_some()) {
        match &mut input.descriptor {
            DataDescriptor::BinaryFile(file) => file.path = file_name.to_string(),
            DataDescriptor::TextFile(file) => file.path = file_name.to_string(),
            _ => {}
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinaryFile, TypedBuffer};

    #[test]
    fn test_request_json_shape() {
        let request = PipelineRequest::from_json(serde_json::json!({
            "operation": "readImage",
            "fileName": "scan.nii.gz",
            "inputs": [{
                "type": "BinaryFile",
                "data": { "path": "scan.nii.gz", "data": { "elementType": "uint8", "data": "AAE=" } }
            }],
            "config": { "pipelinesUrl": "p", "imageIOUrl": "i", "meshIOUrl": "m" }
        }))
        .unwrap();
        assert_eq!(request.operation, "readImage");
        assert_eq!(request.inputs.len(), 1);
        assert_eq!(request.config.unwrap().image_io_url.as_deref(), Some("i"));
    }

    #[test]
    fn test_request_config_size_limit_is_invalid_request() {
        let err = PipelineRequest::from_json(serde_json::json!({
            "operation": "runPipeline",
            "config": { "pipelinesUrl": "p", "maxModuleBytes": 1024 }
        }))
        .unwrap_err();
        match err {
            BridgeError::InvalidRequest(message) => assert!(message.contains("maxModuleBytes")),
            other => panic!("Expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_descriptor_tag_is_unsupported_type() {
        let err = PipelineRequest::from_json(serde_json::json!({
            "operation": "runPipeline",
            "outputs": [{ "type": "Volume" }]
        }))
        .unwrap_err();
        assert!(err.is_unsupported_type());
    }

    #[test]
    fn test_place_file_renames_first_file_input() {
        let inputs = vec![PipelineInput::from(DataDescriptor::BinaryFile(BinaryFile {
            path: "/tmp/upload-1234".to_string(),
            data: TypedBuffer::from_u8s(&[1]),
        }))];
        let placed = place_file(&inputs, "brain.nrrd");
        assert_eq!(file_path(&placed[0]), Some("brain.nrrd"));
        assert_eq!(file_path(&inputs[0]), Some("/tmp/upload-1234"));
    }

    #[test]
    fn test_response_serializes_without_transferables() {
        let response = BridgeResponse {
            return_value: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
            outputs: Vec::new(),
            transferables: vec![Arc::from(vec![1u8, 2])],
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["returnValue"], 0);
        assert!(value.get("transferables").is_none());
    }
}
