pub mod bindings;
pub mod read;
pub mod run;

use anyhow::{Context as _, Result};
use pipeline_bridge_core::BridgeResponse;
use std::process::ExitCode;

/// Print the response envelope and return the pipeline return code as the exit status
pub(crate) fn emit(response: &BridgeResponse) -> Result<ExitCode> {
    let json = serde_json::to_string_pretty(response).context("Failed to serialize response")?;
    println!("{json}");
    Ok(ExitCode::from(exit_status(response.return_value)))
}

/// Return codes outside 0..=255 cannot be a process status; they map to 1
fn exit_status(return_value: i32) -> u8 {
    u8::try_from(return_value).unwrap_or(1)
}
