//! Run command: handle a raw request document

use super::emit;
use anyhow::{Context as _, Result};
use clap::Args;
use pipeline_bridge_core::{BridgeConfig, PipelineBridge};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing::debug;

#[derive(Args)]
pub struct RunCommand {
    /// Request document (JSON), or '-' to read it from stdin
    #[arg(value_name = "REQUEST")]
    request: PathBuf,
}

impl RunCommand {
    pub async fn execute(self, config: BridgeConfig) -> Result<ExitCode> {
        let contents = if self.request.as_os_str() == "-" {
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("Failed to read request from stdin")?;
            buffer
        } else {
            tokio::fs::read_to_string(&self.request)
                .await
                .with_context(|| format!("Failed to read {}", self.request.display()))?
        };
        let request: serde_json::Value =
            serde_json::from_str(&contents).context("Request is not valid JSON")?;
        debug!("Request: {}", request);

        // The bridge and its module sandboxes are dropped before the process exits
        let response = {
            let bridge = PipelineBridge::new(config)?;
            bridge.handle_json(request).await?
        };
        emit(&response)
    }
}
