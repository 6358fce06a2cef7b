//! Host-side data model for values exchanged with pipeline modules
//!
//! Every value crossing into or out of a module is a [`DataDescriptor`]. Composite
//! values (images, meshes, poly data) keep their numeric payloads in
//! [`TypedBuffer`]s, which always own their bytes: nothing here ever aliases a
//! module's linear memory.

use crate::error::CodecError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Element type of a typed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ElementType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    None,
}

impl ElementType {
    /// Width of one element in bytes (0 for `None`)
    pub const fn width(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
            Self::None => 0,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::None => "none",
        }
    }
}

impl FromStr for ElementType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int8" => Ok(Self::Int8),
            "uint8" => Ok(Self::UInt8),
            "int16" => Ok(Self::Int16),
            "uint16" => Ok(Self::UInt16),
            "int32" => Ok(Self::Int32),
            "uint32" => Ok(Self::UInt32),
            "int64" => Ok(Self::Int64),
            "uint64" => Ok(Self::UInt64),
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            "none" | "null" => Ok(Self::None),
            other => Err(CodecError::UnsupportedType(format!(
                "component type '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for ElementType {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel layout of an image, mesh or poly data attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelType {
    Unknown,
    #[default]
    Scalar,
    RGB,
    RGBA,
    Offset,
    Vector,
    Point,
    CovariantVector,
    SymmetricSecondRankTensor,
    DiffusionTensor3D,
    Complex,
    FixedArray,
    Array,
    Matrix,
    VariableLengthVector,
    VariableSizeMatrix,
}

/// Backing storage of a [`TypedBuffer`]
#[derive(Debug, Clone)]
pub enum BufferStorage {
    /// Plainly owned bytes; may be handed to the caller without copying
    Owned(Arc<[u8]>),

    /// Bytes also referenced from another execution context; must be read, never moved
    Shared(Arc<[u8]>),
}

impl BufferStorage {
    fn bytes(&self) -> &Arc<[u8]> {
        match self {
            Self::Owned(bytes) | Self::Shared(bytes) => bytes,
        }
    }
}

/// A byte buffer tagged with its element type
///
/// The byte length is always a whole number of elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTypedBuffer", into = "RawTypedBuffer")]
pub struct TypedBuffer {
    element_type: ElementType,
    storage: BufferStorage,
}

impl TypedBuffer {
    /// Create an owned buffer, checking the length against the element width
    pub fn new(element_type: ElementType, bytes: impl Into<Arc<[u8]>>) -> Result<Self, CodecError> {
        Self::with_storage(element_type, BufferStorage::Owned(bytes.into()))
    }

    /// Create a buffer marked as shared with another execution context
    pub fn shared(element_type: ElementType, bytes: Arc<[u8]>) -> Result<Self, CodecError> {
        Self::with_storage(element_type, BufferStorage::Shared(bytes))
    }

    fn with_storage(element_type: ElementType, storage: BufferStorage) -> Result<Self, CodecError> {
        let len = storage.bytes().len();
        let width = element_type.width();
        let valid = if width == 0 { len == 0 } else { len % width == 0 };
        if !valid {
            return Err(CodecError::InvalidBuffer(format!(
                "{len} bytes is not a whole number of {element_type} elements"
            )));
        }
        Ok(Self {
            element_type,
            storage,
        })
    }

    /// Empty buffer of the given element type
    pub fn empty(element_type: ElementType) -> Self {
        Self {
            element_type,
            storage: BufferStorage::Owned(Arc::from(Vec::<u8>::new())),
        }
    }

    pub fn from_u8s(values: &[u8]) -> Self {
        Self {
            element_type: ElementType::UInt8,
            storage: BufferStorage::Owned(Arc::from(values)),
        }
    }

    pub fn from_u32s(values: &[u32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            element_type: ElementType::UInt32,
            storage: BufferStorage::Owned(Arc::from(bytes)),
        }
    }

    pub fn from_f32s(values: &[f32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            element_type: ElementType::Float32,
            storage: BufferStorage::Owned(Arc::from(bytes)),
        }
    }

    pub fn from_f64s(values: &[f64]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            element_type: ElementType::Float64,
            storage: BufferStorage::Owned(Arc::from(bytes)),
        }
    }

    /// Decode a float64 buffer into values
    pub fn to_f64s(&self) -> Option<Vec<f64>> {
        if self.element_type != ElementType::Float64 {
            return None;
        }
        Some(
            self.as_bytes()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.bytes()
    }

    pub fn storage(&self) -> &BufferStorage {
        &self.storage
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.storage, BufferStorage::Shared(_))
    }

    pub fn byte_len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self.element_type.width() {
            0 => 0,
            width => self.byte_len() / width,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len() == 0
    }
}

impl PartialEq for TypedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.element_type == other.element_type && self.as_bytes() == other.as_bytes()
    }
}

/// Transport form of a typed buffer: element type plus base64 payload
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTypedBuffer {
    element_type: ElementType,
    data: String,
}

impl TryFrom<RawTypedBuffer> for TypedBuffer {
    type Error = CodecError;

    fn try_from(raw: RawTypedBuffer) -> Result<Self, Self::Error> {
        let bytes = BASE64
            .decode(raw.data.as_bytes())
            .map_err(|e| CodecError::InvalidBuffer(format!("invalid base64 payload: {e}")))?;
        TypedBuffer::new(raw.element_type, bytes)
    }
}

impl From<TypedBuffer> for RawTypedBuffer {
    fn from(buffer: TypedBuffer) -> Self {
        Self {
            element_type: buffer.element_type,
            data: BASE64.encode(buffer.as_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageType {
    pub dimension: u32,
    pub component_type: ElementType,
    pub pixel_type: PixelType,
    pub components: u32,
}

impl Default for ImageType {
    fn default() -> Self {
        Self {
            dimension: 2,
            component_type: ElementType::UInt8,
            pixel_type: PixelType::Scalar,
            components: 1,
        }
    }
}

/// N-dimensional image with physical-space metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub image_type: ImageType,
    #[serde(default)]
    pub name: String,
    pub origin: Vec<f64>,
    pub spacing: Vec<f64>,
    /// Row-major `dimension x dimension` float64 matrix
    pub direction: TypedBuffer,
    pub size: Vec<u64>,
    pub data: TypedBuffer,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Image {
    /// Empty image of the given type: zero size, unit spacing, identity direction
    pub fn new(image_type: ImageType) -> Self {
        let dimension = image_type.dimension as usize;
        let mut direction = vec![0.0; dimension * dimension];
        for i in 0..dimension {
            direction[i * dimension + i] = 1.0;
        }
        let component_type = image_type.component_type;
        Self {
            image_type,
            name: String::new(),
            origin: vec![0.0; dimension],
            spacing: vec![1.0; dimension],
            direction: TypedBuffer::from_f64s(&direction),
            size: vec![0; dimension],
            data: TypedBuffer::empty(component_type),
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshType {
    pub dimension: u32,
    pub point_component_type: ElementType,
    pub point_pixel_component_type: ElementType,
    pub point_pixel_type: PixelType,
    pub point_pixel_components: u32,
    pub cell_component_type: ElementType,
    pub cell_pixel_component_type: ElementType,
    pub cell_pixel_type: PixelType,
    pub cell_pixel_components: u32,
}

impl Default for MeshType {
    fn default() -> Self {
        Self {
            dimension: 3,
            point_component_type: ElementType::Float32,
            point_pixel_component_type: ElementType::Float32,
            point_pixel_type: PixelType::Scalar,
            point_pixel_components: 1,
            cell_component_type: ElementType::UInt32,
            cell_pixel_component_type: ElementType::Float32,
            cell_pixel_type: PixelType::Scalar,
            cell_pixel_components: 1,
        }
    }
}

/// Unstructured mesh: points, cells and optional per-point / per-cell pixel data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mesh {
    pub mesh_type: MeshType,
    #[serde(default)]
    pub name: String,
    pub number_of_points: u64,
    pub points: TypedBuffer,
    pub number_of_point_pixels: u64,
    pub point_data: TypedBuffer,
    pub number_of_cells: u64,
    pub cells: TypedBuffer,
    pub cell_buffer_size: u64,
    pub number_of_cell_pixels: u64,
    pub cell_data: TypedBuffer,
}

impl Mesh {
    pub fn new(mesh_type: MeshType) -> Self {
        Self {
            points: TypedBuffer::empty(mesh_type.point_component_type),
            point_data: TypedBuffer::empty(mesh_type.point_pixel_component_type),
            cells: TypedBuffer::empty(mesh_type.cell_component_type),
            cell_data: TypedBuffer::empty(mesh_type.cell_pixel_component_type),
            mesh_type,
            name: String::new(),
            number_of_points: 0,
            number_of_point_pixels: 0,
            number_of_cells: 0,
            cell_buffer_size: 0,
            number_of_cell_pixels: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolyDataType {
    pub point_pixel_component_type: ElementType,
    pub point_pixel_type: PixelType,
    pub point_pixel_components: u32,
    pub cell_pixel_component_type: ElementType,
    pub cell_pixel_type: PixelType,
    pub cell_pixel_components: u32,
}

impl Default for PolyDataType {
    fn default() -> Self {
        Self {
            point_pixel_component_type: ElementType::Float32,
            point_pixel_type: PixelType::Scalar,
            point_pixel_components: 1,
            cell_pixel_component_type: ElementType::Float32,
            cell_pixel_type: PixelType::Scalar,
            cell_pixel_components: 1,
        }
    }
}

/// Surface made of float32 points and uint32 vertex/line/polygon/strip connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolyData {
    pub poly_data_type: PolyDataType,
    #[serde(default)]
    pub name: String,
    pub number_of_points: u64,
    pub points: TypedBuffer,
    pub vertices_buffer_size: u64,
    pub vertices: TypedBuffer,
    pub lines_buffer_size: u64,
    pub lines: TypedBuffer,
    pub polygons_buffer_size: u64,
    pub polygons: TypedBuffer,
    pub triangle_strips_buffer_size: u64,
    pub triangle_strips: TypedBuffer,
    pub number_of_point_pixels: u64,
    pub point_data: TypedBuffer,
    pub number_of_cell_pixels: u64,
    pub cell_data: TypedBuffer,
}

impl PolyData {
    pub fn new(poly_data_type: PolyDataType) -> Self {
        Self {
            point_data: TypedBuffer::empty(poly_data_type.point_pixel_component_type),
            cell_data: TypedBuffer::empty(poly_data_type.cell_pixel_component_type),
            poly_data_type,
            name: String::new(),
            number_of_points: 0,
            points: TypedBuffer::empty(ElementType::Float32),
            vertices_buffer_size: 0,
            vertices: TypedBuffer::empty(ElementType::UInt32),
            lines_buffer_size: 0,
            lines: TypedBuffer::empty(ElementType::UInt32),
            polygons_buffer_size: 0,
            polygons: TypedBuffer::empty(ElementType::UInt32),
            triangle_strips_buffer_size: 0,
            triangle_strips: TypedBuffer::empty(ElementType::UInt32),
            number_of_point_pixels: 0,
            number_of_cell_pixels: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStream {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryStream {
    pub data: TypedBuffer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFile {
    pub path: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryFile {
    pub path: String,
    pub data: TypedBuffer,
}

/// Names of every descriptor type tag, in declaration order
pub const DESCRIPTOR_TYPES: [&str; 7] = [
    "TextStream",
    "BinaryStream",
    "TextFile",
    "BinaryFile",
    "Image",
    "Mesh",
    "PolyData",
];

/// One input value or populated output, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DataDescriptor {
    TextStream(TextStream),
    BinaryStream(BinaryStream),
    TextFile(TextFile),
    BinaryFile(BinaryFile),
    Image(Image),
    Mesh(Mesh),
    PolyData(PolyData),
}

impl DataDescriptor {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TextStream(_) => "TextStream",
            Self::BinaryStream(_) => "BinaryStream",
            Self::TextFile(_) => "TextFile",
            Self::BinaryFile(_) => "BinaryFile",
            Self::Image(_) => "Image",
            Self::Mesh(_) => "Mesh",
            Self::PolyData(_) => "PolyData",
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_mesh(&self) -> Option<&Mesh> {
        match self {
            Self::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_poly_data(&self) -> Option<&PolyData> {
        match self {
            Self::PolyData(poly_data) => Some(poly_data),
            _ => None,
        }
    }
}

/// An input value plus, for composite values, an optional virtual-filesystem location
///
/// With a `path`, images, meshes and poly data are written as a directory
/// (`index.json` + `data/*.raw`) instead of through linear memory.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawPipelineInput")]
pub struct PipelineInput {
    pub descriptor: DataDescriptor,
    pub path: Option<String>,
}

impl PipelineInput {
    pub fn at_path(descriptor: DataDescriptor, path: impl Into<String>) -> Self {
        Self {
            descriptor,
            path: Some(path.into()),
        }
    }
}

impl From<DataDescriptor> for PipelineInput {
    fn from(descriptor: DataDescriptor) -> Self {
        Self {
            descriptor,
            path: None,
        }
    }
}

impl Serialize for PipelineInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.path.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("PipelineInput", fields)?;
        state.serialize_field("type", self.descriptor.type_name())?;
        match &self.descriptor {
            DataDescriptor::TextStream(v) => state.serialize_field("data", v)?,
            DataDescriptor::BinaryStream(v) => state.serialize_field("data", v)?,
            DataDescriptor::TextFile(v) => state.serialize_field("data", v)?,
            DataDescriptor::BinaryFile(v) => state.serialize_field("data", v)?,
            DataDescriptor::Image(v) => state.serialize_field("data", v)?,
            DataDescriptor::Mesh(v) => state.serialize_field("data", v)?,
            DataDescriptor::PolyData(v) => state.serialize_field("data", v)?,
        }
        if let Some(path) = &self.path {
            state.serialize_field("path", path)?;
        }
        state.end()
    }
}

#[derive(Deserialize)]
struct RawPipelineInput {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
    #[serde(default)]
    path: Option<String>,
}

impl TryFrom<RawPipelineInput> for PipelineInput {
    type Error = CodecError;

    fn try_from(raw: RawPipelineInput) -> Result<Self, Self::Error> {
        if !DESCRIPTOR_TYPES.contains(&raw.kind.as_str()) {
            return Err(CodecError::UnsupportedType(format!(
                "descriptor type '{}'",
                raw.kind
            )));
        }
        let descriptor = serde_json::from_value(serde_json::json!({
            "type": raw.kind,
            "data": raw.data,
        }))?;
        Ok(Self {
            descriptor,
            path: raw.path,
        })
    }
}

/// Expected output of a pipeline: the kind only, never data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputSpec {
    TextStream,
    BinaryStream,
    TextFile {
        path: String,
    },
    BinaryFile {
        path: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Mesh {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    PolyData {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

impl OutputSpec {
    pub fn image() -> Self {
        Self::Image { path: None }
    }

    pub fn mesh() -> Self {
        Self::Mesh { path: None }
    }

    pub fn poly_data() -> Self {
        Self::PolyData { path: None }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TextStream => "TextStream",
            Self::BinaryStream => "BinaryStream",
            Self::TextFile { .. } => "TextFile",
            Self::BinaryFile { .. } => "BinaryFile",
            Self::Image { .. } => "Image",
            Self::Mesh { .. } => "Mesh",
            Self::PolyData { .. } => "PolyData",
        }
    }
}
