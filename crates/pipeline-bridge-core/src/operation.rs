//! Operations the front controller understands

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "runPipeline")]
    RunPipeline,
    #[serde(rename = "readImage")]
    ReadImage,
    #[serde(rename = "writeImage")]
    WriteImage,
    #[serde(rename = "readMesh")]
    ReadMesh,
    #[serde(rename = "writeMesh")]
    WriteMesh,
    #[serde(rename = "meshToPolyData")]
    MeshToPolyData,
    #[serde(rename = "polyDataToMesh")]
    PolyDataToMesh,
    #[serde(rename = "readDICOMImageSeries")]
    ReadDicomImageSeries,
    #[serde(rename = "readDICOMTags")]
    ReadDicomTags,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Self::RunPipeline,
        Self::ReadImage,
        Self::WriteImage,
        Self::ReadMesh,
        Self::WriteMesh,
        Self::MeshToPolyData,
        Self::PolyDataToMesh,
        Self::ReadDicomImageSeries,
        Self::ReadDicomTags,
    ];

    /// Wire name of the operation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunPipeline => "runPipeline",
            Self::ReadImage => "readImage",
            Self::WriteImage => "writeImage",
            Self::ReadMesh => "readMesh",
            Self::WriteMesh => "writeMesh",
            Self::MeshToPolyData => "meshToPolyData",
            Self::PolyDataToMesh => "polyDataToMesh",
            Self::ReadDicomImageSeries => "readDICOMImageSeries",
            Self::ReadDicomTags => "readDICOMTags",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == s)
            .ok_or_else(|| BridgeError::UnknownOperation(s.to_string()))
    }
}
