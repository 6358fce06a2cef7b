//! Read command: load a local file and read it through the format resolver

use super::emit;
use anyhow::{Context as _, Result};
use clap::Args;
use pipeline_bridge_core::{
    BinaryFile, BridgeConfig, DataDescriptor, Domain, Operation, PipelineBridge, PipelineRequest,
    TypedBuffer,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Args)]
pub struct ReadCommand {
    /// File to read
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Mime type, when known; takes precedence over the file extension
    #[arg(long)]
    mime: Option<String>,
}

impl ReadCommand {
    pub async fn execute(self, domain: Domain, config: BridgeConfig) -> Result<ExitCode> {
        let bytes = tokio::fs::read(&self.input)
            .await
            .with_context(|| format!("Failed to read {}", self.input.display()))?;
        let file_name = self
            .input
            .file_name()
            .and_then(|name| name.to_str())
            .context("Input path has no usable file name")?
            .to_string();
        info!("Reading {} ({} bytes) as {}", file_name, bytes.len(), domain);

        let operation = match domain {
            Domain::Image => Operation::ReadImage,
            Domain::Mesh => Operation::ReadMesh,
        };
        let request = PipelineRequest {
            mime_type: self.mime,
            file_name: Some(file_name.clone()),
            inputs: vec![DataDescriptor::BinaryFile(BinaryFile {
                path: file_name,
                data: TypedBuffer::from_u8s(&bytes),
            })
            .into()],
            ..PipelineRequest::new(operation)
        };

        // The bridge and its module sandboxes are dropped before the process exits
        let response = {
            let bridge = PipelineBridge::new(config)?;
            bridge.handle(request).await?
        };
        emit(&response)
    }
}
