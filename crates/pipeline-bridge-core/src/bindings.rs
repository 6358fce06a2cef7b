//! IO binding tables: which backend handles which mime type or file extension

use crate::error::BridgeError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Data domain a backend reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Image,
    Mesh,
}

impl Domain {
    pub fn bindings(self) -> &'static IoBindings {
        match self {
            Self::Image => &IMAGE_IO,
            Self::Mesh => &MESH_IO,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Mesh => "mesh",
        }
    }

    /// Module name of `backend`'s reader, e.g. `png-read-image`
    pub fn read_module(self, backend: &str) -> String {
        format!("{}-read-{}", backend, self.as_str())
    }

    /// Module name of `backend`'s writer, e.g. `vtk-write-mesh`
    pub fn write_module(self, backend: &str) -> String {
        format!("{}-write-{}", backend, self.as_str())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "mesh" => Ok(Self::Mesh),
            other => Err(BridgeError::InvalidRequest(format!(
                "unknown IO domain '{other}'"
            ))),
        }
    }
}

/// Declarative lookup tables plus the trial order for one domain
#[derive(Debug)]
pub struct IoBindings {
    pub domain: Domain,
    pub mime_types: HashMap<&'static str, &'static str>,
    pub extensions: HashMap<&'static str, &'static str>,
    /// Every backend of the domain, in trial order
    pub priority: &'static [&'static str],
}

impl IoBindings {
    pub fn backend_for_mime(&self, mime_type: &str) -> Option<&'static str> {
        self.mime_types.get(mime_type).copied()
    }

    /// Case-insensitive extension lookup (without the leading dot)
    pub fn backend_for_extension(&self, extension: &str) -> Option<&'static str> {
        self.extensions
            .get(extension.to_lowercase().as_str())
            .copied()
    }
}

const IMAGE_PRIORITY: &[&str] = &[
    "png",
    "meta-image",
    "tiff",
    "nifti",
    "jpeg",
    "nrrd",
    "vtk",
    "bmp",
    "hdf5",
    "minc",
    "mrc",
    "lsm",
    "mgh",
    "bio-rad",
    "gipl",
    "ge-adw",
    "ge4",
    "ge5",
    "gdcm",
    "scanco",
    "fdf",
    "wasm",
    "wasm-zstd",
];

const MESH_PRIORITY: &[&str] = &[
    "byu",
    "free-surfer-ascii",
    "free-surfer-binary",
    "obj",
    "off",
    "stl",
    "swc",
    "vtk-poly-data",
    "wasm",
    "wasm-zstd",
];

pub static IMAGE_IO: Lazy<IoBindings> = Lazy::new(|| IoBindings {
    domain: Domain::Image,
    mime_types: HashMap::from([
        ("image/jpeg", "jpeg"),
        ("image/png", "png"),
        ("image/tiff", "tiff"),
        ("image/x-ms-bmp", "bmp"),
        ("image/x-bmp", "bmp"),
        ("image/bmp", "bmp"),
        ("application/dicom", "gdcm"),
    ]),
    // Compound keys (`nii.gz`, `iwi.cbor`, ...) are kept for completeness;
    // lookup strips one wrapper suffix first, so they never match.
    extensions: HashMap::from([
        ("bmp", "bmp"),
        ("dcm", "gdcm"),
        ("gipl", "gipl"),
        ("gipl.gz", "gipl"),
        ("hdf5", "hdf5"),
        ("jpg", "jpeg"),
        ("jpeg", "jpeg"),
        ("iwi", "wasm"),
        ("iwi.cbor", "wasm"),
        ("iwi.cbor.zst", "wasm-zstd"),
        ("lsm", "lsm"),
        ("mnc", "minc"),
        ("mnc.gz", "minc"),
        ("mnc2", "minc"),
        ("mgh", "mgh"),
        ("mgz", "mgh"),
        ("mgh.gz", "mgh"),
        ("mha", "meta-image"),
        ("mhd", "meta-image"),
        ("mrc", "mrc"),
        ("nia", "nifti"),
        ("nii", "nifti"),
        ("nii.gz", "nifti"),
        ("hdr", "nifti"),
        ("nrrd", "nrrd"),
        ("nhdr", "nrrd"),
        ("png", "png"),
        ("pic", "bio-rad"),
        ("tif", "tiff"),
        ("tiff", "tiff"),
        ("vtk", "vtk"),
        ("isq", "scanco"),
        ("aim", "scanco"),
        ("fdf", "fdf"),
    ]),
    priority: IMAGE_PRIORITY,
});

pub static MESH_IO: Lazy<IoBindings> = Lazy::new(|| IoBindings {
    domain: Domain::Mesh,
    mime_types: HashMap::from([
        ("model/obj", "obj"),
        ("model/stl", "stl"),
        ("application/sla", "stl"),
    ]),
    extensions: HashMap::from([
        ("vtk", "vtk-poly-data"),
        ("byu", "byu"),
        ("fsa", "free-surfer-ascii"),
        ("fsb", "free-surfer-binary"),
        ("obj", "obj"),
        ("off", "off"),
        ("stl", "stl"),
        ("swc", "swc"),
        ("iwm", "wasm"),
        ("iwm.cbor", "wasm"),
        ("iwm.cbor.zst", "wasm-zstd"),
    ]),
    priority: MESH_PRIORITY,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_lookup_is_case_insensitive() {
        assert_eq!(IMAGE_IO.backend_for_extension("PNG"), Some("png"));
        assert_eq!(IMAGE_IO.backend_for_extension("mhd"), Some("meta-image"));
        assert_eq!(MESH_IO.backend_for_extension("vtk"), Some("vtk-poly-data"));
        assert_eq!(MESH_IO.backend_for_extension("xyz"), None);
    }

    #[test]
    fn test_every_table_entry_is_a_known_backend() {
        for bindings in [&*IMAGE_IO, &*MESH_IO] {
            for backend in bindings.mime_types.values().chain(bindings.extensions.values()) {
                assert!(
                    bindings.priority.contains(backend),
                    "{backend} missing from {} priority list",
                    bindings.domain
                );
            }
        }
    }

    #[test]
    fn test_module_names() {
        assert_eq!(Domain::Image.read_module("png"), "png-read-image");
        assert_eq!(Domain::Mesh.write_module("stl"), "stl-write-mesh");
        assert_eq!("Mesh".parse::<Domain>().unwrap(), Domain::Mesh);
        assert!("volume".parse::<Domain>().is_err());
    }
}
