//! Data codec: host descriptors <-> module memory and virtual filesystem
//!
//! Buffers are copied into freshly allocated module memory; composite values
//! additionally get a JSON metadata blob whose buffer fields hold address
//! references (`data:application/vnd.itk.address,0:<offset>`). Reading an
//! output always copies out of module memory into a newly owned buffer.
//!
//! Buffer sub-indices per slot:
//!
//! | kind     | 0      | 1         | 2         | 3        | 4              | 5         | 6        |
//! |----------|--------|-----------|-----------|----------|----------------|-----------|----------|
//! | stream   | data   |           |           |          |                |           |          |
//! | Image    | data   | direction |           |          |                |           |          |
//! | Mesh     | points | cells     | pointData | cellData |                |           |          |
//! | PolyData | points | vertices  | lines     | polygons | triangleStrips | pointData | cellData |

use crate::error::CodecError;
use crate::runtime::{BufferSlot, MemoryHandle, ModuleInstance};
use crate::types::{
    BinaryFile, BinaryStream, DataDescriptor, ElementType, Image, ImageType, Mesh, MeshType,
    OutputSpec, PipelineInput, PolyData, PolyDataType, TextFile, TextStream, TypedBuffer,
};
use crate::vfs::{self, VirtualFs};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Scheme prefix of an in-module address reference
pub const ADDRESS_SCHEME: &str = "data:application/vnd.itk.address,0:";

/// Metadata file of a composite value stored in the virtual filesystem
pub const INDEX_FILE: &str = "index.json";

/// Render a handle as an address reference string
pub fn address_reference(handle: MemoryHandle) -> String {
    format!("{ADDRESS_SCHEME}{}", handle.offset())
}

/// Parse an address reference string back into a handle
pub fn parse_address_reference(reference: &str) -> Result<MemoryHandle, CodecError> {
    reference
        .strip_prefix(ADDRESS_SCHEME)
        .and_then(|offset| offset.parse::<u32>().ok())
        .map(MemoryHandle::new)
        .ok_or_else(|| CodecError::InvalidAddress(reference.to_string()))
}

/// Write input `index` into the module
pub fn write_input(
    instance: &mut dyn ModuleInstance,
    index: usize,
    input: &PipelineInput,
) -> Result<(), CodecError> {
    debug!(
        "Writing input {} ({})",
        index,
        input.descriptor.type_name()
    );
    match (&input.descriptor, input.path.as_deref()) {
        (DataDescriptor::TextStream(stream), _) => {
            write_stream(instance, index, stream.data.as_bytes())
        }
        (DataDescriptor::BinaryStream(stream), _) => {
            write_stream(instance, index, stream.data.as_bytes())
        }
        (DataDescriptor::TextFile(file), _) => {
            VirtualFs::new(instance.filesystem()).write(&file.path, file.data.as_bytes())
        }
        (DataDescriptor::BinaryFile(file), _) => {
            VirtualFs::new(instance.filesystem()).write(&file.path, file.data.as_bytes())
        }
        (DataDescriptor::Image(image), Some(dir)) => {
            let fs = VirtualFs::new(instance.filesystem());
            let header = image_header(image, &mut |name, _, buffer| write_raw(&fs, dir, name, buffer))?;
            write_index(&fs, dir, &header)
        }
        (DataDescriptor::Image(image), None) => {
            let header = image_header(image, &mut |_, sub, buffer| {
                write_array(&mut *instance, index, sub, buffer)
            })?;
            write_json(instance, index, &header)
        }
        (DataDescriptor::Mesh(mesh), Some(dir)) => {
            let fs = VirtualFs::new(instance.filesystem());
            let header = mesh_header(mesh, &mut |name, _, buffer| write_raw(&fs, dir, name, buffer))?;
            write_index(&fs, dir, &header)
        }
        (DataDescriptor::Mesh(mesh), None) => {
            let header = mesh_header(mesh, &mut |_, sub, buffer| {
                write_array(&mut *instance, index, sub, buffer)
            })?;
            write_json(instance, index, &header)
        }
        (DataDescriptor::PolyData(poly_data), Some(dir)) => {
            let fs = VirtualFs::new(instance.filesystem());
            let header = poly_data_header(poly_data, &mut |name, _, buffer| {
                write_raw(&fs, dir, name, buffer)
            })?;
            write_index(&fs, dir, &header)
        }
        (DataDescriptor::PolyData(poly_data), None) => {
            let header = poly_data_header(poly_data, &mut |_, sub, buffer| {
                write_array(&mut *instance, index, sub, buffer)
            })?;
            write_json(instance, index, &header)
        }
    }
}

/// Read output `index` out of the module as the expected kind
pub fn read_output(
    instance: &mut dyn ModuleInstance,
    index: usize,
    expected: &OutputSpec,
) -> Result<DataDescriptor, CodecError> {
    debug!("Reading output {} ({})", index, expected.type_name());
    match expected {
        OutputSpec::TextStream => {
            let bytes = read_stream(instance, index)?;
            let data = String::from_utf8(bytes)
                .map_err(|e| CodecError::InvalidBuffer(format!("text stream is not UTF-8: {e}")))?;
            Ok(DataDescriptor::TextStream(TextStream { data }))
        }
        OutputSpec::BinaryStream => {
            let bytes = read_stream(instance, index)?;
            Ok(DataDescriptor::BinaryStream(BinaryStream {
                data: TypedBuffer::new(ElementType::UInt8, bytes)?,
            }))
        }
        OutputSpec::TextFile { path } => {
            let bytes = VirtualFs::new(instance.filesystem()).read(path)?;
            let data = String::from_utf8(bytes)
                .map_err(|e| CodecError::InvalidBuffer(format!("{path} is not UTF-8: {e}")))?;
            Ok(DataDescriptor::TextFile(TextFile {
                path: path.clone(),
                data,
            }))
        }
        OutputSpec::BinaryFile { path } => {
            let bytes = VirtualFs::new(instance.filesystem()).read(path)?;
            Ok(DataDescriptor::BinaryFile(BinaryFile {
                path: path.clone(),
                data: TypedBuffer::new(ElementType::UInt8, bytes)?,
            }))
        }
        OutputSpec::Image { path: Some(dir) } => {
            let fs = VirtualFs::new(instance.filesystem());
            let header: ImageHeader = decode_header(&fs.read(&vfs::join(dir, INDEX_FILE))?, "imageType")?;
            let image = image_from_header(header, &mut |_, _, reference, element_type| {
                read_raw(&fs, dir, reference, element_type)
            })?;
            Ok(DataDescriptor::Image(image))
        }
        OutputSpec::Image { path: None } => {
            let header: ImageHeader = decode_header(&read_json(instance, index)?, "imageType")?;
            let image = image_from_header(header, &mut |_, sub, reference, element_type| {
                read_array(&mut *instance, index, sub, reference, element_type)
            })?;
            Ok(DataDescriptor::Image(image))
        }
        OutputSpec::Mesh { path: Some(dir) } => {
            let fs = VirtualFs::new(instance.filesystem());
            let header: MeshHeader = decode_header(&fs.read(&vfs::join(dir, INDEX_FILE))?, "meshType")?;
            let mesh = mesh_from_header(header, &mut |_, _, reference, element_type| {
                read_raw(&fs, dir, reference, element_type)
            })?;
            Ok(DataDescriptor::Mesh(mesh))
        }
        OutputSpec::Mesh { path: None } => {
            let header: MeshHeader = decode_header(&read_json(instance, index)?, "meshType")?;
            let mesh = mesh_from_header(header, &mut |_, sub, reference, element_type| {
                read_array(&mut *instance, index, sub, reference, element_type)
            })?;
            Ok(DataDescriptor::Mesh(mesh))
        }
        OutputSpec::PolyData { path: Some(dir) } => {
            let fs = VirtualFs::new(instance.filesystem());
            let header: PolyDataHeader =
                decode_header(&fs.read(&vfs::join(dir, INDEX_FILE))?, "polyDataType")?;
            let poly_data = poly_data_from_header(header, &mut |_, _, reference, element_type| {
                read_raw(&fs, dir, reference, element_type)
            })?;
            Ok(DataDescriptor::PolyData(poly_data))
        }
        OutputSpec::PolyData { path: None } => {
            let header: PolyDataHeader = decode_header(&read_json(instance, index)?, "polyDataType")?;
            let poly_data = poly_data_from_header(header, &mut |_, sub, reference, element_type| {
                read_array(&mut *instance, index, sub, reference, element_type)
            })?;
            Ok(DataDescriptor::PolyData(poly_data))
        }
    }
}

// ============================================================================
// Linear memory
// ============================================================================

fn write_array(
    instance: &mut dyn ModuleInstance,
    index: usize,
    sub: u32,
    buffer: &TypedBuffer,
) -> Result<String, CodecError> {
    let handle = instance.alloc(index, BufferSlot::Array(sub), buffer.byte_len())?;
    if !buffer.is_empty() {
        instance.write(handle, buffer.as_bytes())?;
    }
    Ok(address_reference(handle))
}

fn write_json<T: Serialize>(
    instance: &mut dyn ModuleInstance,
    index: usize,
    value: &T,
) -> Result<(), CodecError> {
    let bytes = serde_json::to_vec(value)?;
    let handle = instance.alloc(index, BufferSlot::Json, bytes.len())?;
    instance.write(handle, &bytes)
}

fn write_stream(
    instance: &mut dyn ModuleInstance,
    index: usize,
    bytes: &[u8],
) -> Result<(), CodecError> {
    let handle = instance.alloc(index, BufferSlot::Array(0), bytes.len())?;
    if !bytes.is_empty() {
        instance.write(handle, bytes)?;
    }
    let header = StreamHeader {
        size: bytes.len() as u64,
        data: address_reference(handle),
    };
    write_json(instance, index, &header)
}

fn read_stream(instance: &mut dyn ModuleInstance, index: usize) -> Result<Vec<u8>, CodecError> {
    let (handle, len) = instance.output(index, BufferSlot::Array(0))?;
    if len == 0 {
        return Ok(Vec::new());
    }
    instance.read(handle, len)
}

fn read_json(instance: &mut dyn ModuleInstance, index: usize) -> Result<Vec<u8>, CodecError> {
    let (handle, len) = instance.output(index, BufferSlot::Json)?;
    instance.read(handle, len)
}

/// Fetch the buffer the JSON metadata points at; its length comes from the module
fn read_array(
    instance: &mut dyn ModuleInstance,
    index: usize,
    sub: u32,
    reference: &str,
    element_type: ElementType,
) -> Result<TypedBuffer, CodecError> {
    let (_, len) = instance.output(index, BufferSlot::Array(sub))?;
    if len == 0 {
        return Ok(TypedBuffer::empty(element_type));
    }
    let handle = parse_address_reference(reference)?;
    typed(element_type, instance.read(handle, len)?)
}

// ============================================================================
// Virtual filesystem
// ============================================================================

fn write_raw(
    fs: &VirtualFs<'_>,
    dir: &str,
    name: &str,
    buffer: &TypedBuffer,
) -> Result<String, CodecError> {
    let reference = format!("data/{name}.raw");
    fs.write(&vfs::join(dir, &reference), buffer.as_bytes())?;
    Ok(reference)
}

fn write_index<T: Serialize>(fs: &VirtualFs<'_>, dir: &str, header: &T) -> Result<(), CodecError> {
    let bytes = serde_json::to_vec_pretty(header)?;
    fs.write(&vfs::join(dir, INDEX_FILE), &bytes)
}

fn read_raw(
    fs: &VirtualFs<'_>,
    dir: &str,
    reference: &str,
    element_type: ElementType,
) -> Result<TypedBuffer, CodecError> {
    let path = vfs::join(dir, reference);
    if !fs.exists(&path) {
        return Ok(TypedBuffer::empty(element_type));
    }
    typed(element_type, fs.read(&path)?)
}

// ============================================================================
// Metadata headers
// ============================================================================

fn typed(element_type: ElementType, bytes: Vec<u8>) -> Result<TypedBuffer, CodecError> {
    if element_type == ElementType::None && !bytes.is_empty() {
        return Err(CodecError::UnsupportedType(format!(
            "{} bytes declared with component type 'none'",
            bytes.len()
        )));
    }
    TypedBuffer::new(element_type, bytes)
}

/// Parse a metadata blob, rejecting unknown component types before typed decoding
fn decode_header<T: DeserializeOwned>(bytes: &[u8], type_key: &str) -> Result<T, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    if let Some(Value::Object(fields)) = value.get(type_key) {
        for (key, field) in fields {
            if let (true, Value::String(name)) = (
                key.to_ascii_lowercase().ends_with("componenttype"),
                field,
            ) {
                name.parse::<ElementType>()?;
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Serialize, Deserialize)]
struct StreamHeader {
    size: u64,
    data: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageHeader {
    image_type: ImageType,
    #[serde(default)]
    name: String,
    origin: Vec<f64>,
    spacing: Vec<f64>,
    direction: String,
    size: Vec<u64>,
    data: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeshHeader {
    mesh_type: MeshType,
    #[serde(default)]
    name: String,
    number_of_points: u64,
    points: String,
    number_of_point_pixels: u64,
    point_data: String,
    number_of_cells: u64,
    cells: String,
    cell_buffer_size: u64,
    number_of_cell_pixels: u64,
    cell_data: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolyDataHeader {
    poly_data_type: PolyDataType,
    #[serde(default)]
    name: String,
    number_of_points: u64,
    points: String,
    vertices_buffer_size: u64,
    vertices: String,
    lines_buffer_size: u64,
    lines: String,
    polygons_buffer_size: u64,
    polygons: String,
    triangle_strips_buffer_size: u64,
    triangle_strips: String,
    number_of_point_pixels: u64,
    point_data: String,
    number_of_cell_pixels: u64,
    cell_data: String,
}

/// Stores one buffer and returns the reference recorded in the metadata
type Store<'f> = dyn FnMut(&'static str, u32, &TypedBuffer) -> Result<String, CodecError> + 'f;

/// Loads one buffer given its metadata reference and declared element type
type Load<'f> =
    dyn FnMut(&'static str, u32, &str, ElementType) -> Result<TypedBuffer, CodecError> + 'f;

fn image_header(image: &Image, store: &mut Store<'_>) -> Result<ImageHeader, CodecError> {
    Ok(ImageHeader {
        data: store("data", 0, &image.data)?,
        direction: store("direction", 1, &image.direction)?,
        image_type: image.image_type.clone(),
        name: image.name.clone(),
        origin: image.origin.clone(),
        spacing: image.spacing.clone(),
        size: image.size.clone(),
        metadata: image.metadata.clone(),
    })
}

fn image_from_header(header: ImageHeader, load: &mut Load<'_>) -> Result<Image, CodecError> {
    let data = load("data", 0, &header.data, header.image_type.component_type)?;
    let direction = load("direction", 1, &header.direction, ElementType::Float64)?;
    Ok(Image {
        image_type: header.image_type,
        name: header.name,
        origin: header.origin,
        spacing: header.spacing,
        direction,
        size: header.size,
        data,
        metadata: header.metadata,
    })
}

fn mesh_header(mesh: &Mesh, store: &mut Store<'_>) -> Result<MeshHeader, CodecError> {
    Ok(MeshHeader {
        points: store("points", 0, &mesh.points)?,
        cells: store("cells", 1, &mesh.cells)?,
        point_data: store("pointData", 2, &mesh.point_data)?,
        cell_data: store("cellData", 3, &mesh.cell_data)?,
        mesh_type: mesh.mesh_type.clone(),
        name: mesh.name.clone(),
        number_of_points: mesh.number_of_points,
        number_of_point_pixels: mesh.number_of_point_pixels,
        number_of_cells: mesh.number_of_cells,
        cell_buffer_size: mesh.cell_buffer_size,
        number_of_cell_pixels: mesh.number_of_cell_pixels,
    })
}

fn mesh_from_header(header: MeshHeader, load: &mut Load<'_>) -> Result<Mesh, CodecError> {
    let mesh_type = header.mesh_type;
    Ok(Mesh {
        points: load("points", 0, &header.points, mesh_type.point_component_type)?,
        cells: load("cells", 1, &header.cells, mesh_type.cell_component_type)?,
        point_data: load(
            "pointData",
            2,
            &header.point_data,
            mesh_type.point_pixel_component_type,
        )?,
        cell_data: load(
            "cellData",
            3,
            &header.cell_data,
            mesh_type.cell_pixel_component_type,
        )?,
        mesh_type,
        name: header.name,
        number_of_points: header.number_of_points,
        number_of_point_pixels: header.number_of_point_pixels,
        number_of_cells: header.number_of_cells,
        cell_buffer_size: header.cell_buffer_size,
        number_of_cell_pixels: header.number_of_cell_pixels,
    })
}

fn poly_data_header(
    poly_data: &PolyData,
    store: &mut Store<'_>,
) -> Result<PolyDataHeader, CodecError> {
    Ok(PolyDataHeader {
        points: store("points", 0, &poly_data.points)?,
        vertices: store("vertices", 1, &poly_data.vertices)?,
        lines: store("lines", 2, &poly_data.lines)?,
        polygons: store("polygons", 3, &poly_data.polygons)?,
        triangle_strips: store("triangleStrips", 4, &poly_data.triangle_strips)?,
        point_data: store("pointData", 5, &poly_data.point_data)?,
        cell_data: store("cellData", 6, &poly_data.cell_data)?,
        poly_data_type: poly_data.poly_data_type.clone(),
        name: poly_data.name.clone(),
        number_of_points: poly_data.number_of_points,
        vertices_buffer_size: poly_data.vertices_buffer_size,
        lines_buffer_size: poly_data.lines_buffer_size,
        polygons_buffer_size: poly_data.polygons_buffer_size,
        triangle_strips_buffer_size: poly_data.triangle_strips_buffer_size,
        number_of_point_pixels: poly_data.number_of_point_pixels,
        number_of_cell_pixels: poly_data.number_of_cell_pixels,
    })
}

fn poly_data_from_header(
    header: PolyDataHeader,
    load: &mut Load<'_>,
) -> Result<PolyData, CodecError> {
    let poly_data_type = header.poly_data_type;
    Ok(PolyData {
        points: load("points", 0, &header.points, ElementType::Float32)?,
        vertices: load("vertices", 1, &header.vertices, ElementType::UInt32)?,
        lines: load("lines", 2, &header.lines, ElementType::UInt32)?,
        polygons: load("polygons", 3, &header.polygons, ElementType::UInt32)?,
        triangle_strips: load(
            "triangleStrips",
            4,
            &header.triangle_strips,
            ElementType::UInt32,
        )?,
        point_data: load(
            "pointData",
            5,
            &header.point_data,
            poly_data_type.point_pixel_component_type,
        )?,
        cell_data: load(
            "cellData",
            6,
            &header.cell_data,
            poly_data_type.cell_pixel_component_type,
        )?,
        poly_data_type,
        name: header.name,
        number_of_points: header.number_of_points,
        vertices_buffer_size: header.vertices_buffer_size,
        lines_buffer_size: header.lines_buffer_size,
        polygons_buffer_size: header.polygons_buffer_size,
        triangle_strips_buffer_size: header.triangle_strips_buffer_size,
        number_of_point_pixels: header.number_of_point_pixels,
        number_of_cell_pixels: header.number_of_cell_pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{NativeContext, NativeRuntime, ModuleRuntime};
    use crate::types::{PixelType, TextFile};

    fn sample_image() -> Image {
        let mut image = Image::new(ImageType {
            dimension: 2,
            component_type: ElementType::UInt16,
            pixel_type: PixelType::Scalar,
            components: 1,
        });
        image.size = vec![2, 2];
        image.spacing = vec![0.5, 0.25];
        image.data = TypedBuffer::new(ElementType::UInt16, vec![1u8, 0, 2, 0, 3, 0, 4, 0]).unwrap();
        image
    }

    fn instance(runtime: &NativeRuntime, name: &str) -> Box<dyn ModuleInstance> {
        runtime.instantiate(name, &[]).unwrap()
    }

    /// Copies input slot 0 to output slot 0, buffer by buffer
    fn echo(ctx: &mut NativeContext<'_>) -> Result<i32, String> {
        let mut json = ctx.input_json(0)?;
        let fields: Vec<String> = json
            .as_object()
            .map(|o| {
                o.iter()
                    .filter(|(_, v)| v.as_str().is_some_and(|s| s.starts_with(ADDRESS_SCHEME)))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        for (sub, field) in ordered_fields(&fields).into_iter().enumerate() {
            let bytes = ctx.input_array(0, sub as u32)?;
            let reference = ctx.set_output_array(0, sub as u32, &bytes)?;
            json[field] = Value::String(reference);
        }
        ctx.set_output_json(0, &json)?;
        Ok(0)
    }

    fn ordered_fields(fields: &[String]) -> Vec<&'static str> {
        const ORDER: [&str; 7] = [
            "data",
            "direction",
            "points",
            "cells",
            "pointData",
            "cellData",
            "vertices",
        ];
        ORDER
            .iter()
            .copied()
            .filter(|name| fields.iter().any(|f| f == name))
            .collect()
    }

    #[test]
    fn test_address_reference_roundtrip() {
        let handle = MemoryHandle::new(4096);
        let reference = address_reference(handle);
        assert_eq!(reference, "data:application/vnd.itk.address,0:4096");
        assert_eq!(parse_address_reference(&reference).unwrap(), handle);
        assert!(matches!(
            parse_address_reference("data:application/json,0:12"),
            Err(CodecError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_image_metadata_uses_address_references() {
        let runtime = NativeRuntime::new();
        runtime.register("inspect", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            let json = ctx.input_json(0)?;
            ctx.print(&json.to_string());
            Ok(0)
        });
        let mut module = instance(&runtime, "inspect");
        module.prepare(&["inspect".to_string()]).unwrap();
        write_input(module.as_mut(), 0, &DataDescriptor::Image(sample_image()).into()).unwrap();
        module.invoke().unwrap();

        let json: Value = serde_json::from_str(&module.stdout()).unwrap();
        assert!(json["data"].as_str().unwrap().starts_with(ADDRESS_SCHEME));
        assert!(json["direction"].as_str().unwrap().starts_with(ADDRESS_SCHEME));
        assert_eq!(json["imageType"]["componentType"], "uint16");
        assert_eq!(json["size"], serde_json::json!([2, 2]));
    }

    #[test]
    fn test_image_memory_echo() {
        let runtime = NativeRuntime::new();
        runtime.register("echo", echo);
        let mut module = instance(&runtime, "echo");
        module.prepare(&["echo".to_string()]).unwrap();

        let image = sample_image();
        write_input(module.as_mut(), 0, &DataDescriptor::Image(image.clone()).into()).unwrap();
        assert_eq!(module.invoke().unwrap(), 0);

        let output = read_output(module.as_mut(), 0, &OutputSpec::image()).unwrap();
        assert_eq!(output.as_image(), Some(&image));
    }

    #[test]
    fn test_empty_mesh_buffers_stay_typed() {
        let runtime = NativeRuntime::new();
        runtime.register("echo", echo);
        let mut module = instance(&runtime, "echo");
        module.prepare(&["echo".to_string()]).unwrap();

        let mut mesh = Mesh::new(MeshType::default());
        mesh.number_of_points = 2;
        mesh.points = TypedBuffer::from_f32s(&[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        write_input(module.as_mut(), 0, &DataDescriptor::Mesh(mesh.clone()).into()).unwrap();
        module.invoke().unwrap();

        let output = read_output(module.as_mut(), 0, &OutputSpec::mesh()).unwrap();
        let read = output.as_mesh().unwrap();
        assert_eq!(read.points, mesh.points);
        assert!(read.cells.is_empty());
        assert_eq!(read.cells.element_type(), ElementType::UInt32);
        assert_eq!(read.point_data.element_type(), ElementType::Float32);
    }

    #[test]
    fn test_unknown_component_type_is_unsupported() {
        let runtime = NativeRuntime::new();
        runtime.register("bad", |ctx: &mut NativeContext<'_>| -> Result<i32, String> {
            let reference = ctx.set_output_array(0, 0, &[0u8; 16])?;
            ctx.set_output_json(
                0,
                &serde_json::json!({
                    "imageType": {
                        "dimension": 2,
                        "componentType": "complex128",
                        "pixelType": "Scalar",
                        "components": 1
                    },
                    "origin": [0.0, 0.0],
                    "spacing": [1.0, 1.0],
                    "direction": reference,
                    "size": [1, 1],
                    "data": reference,
                }),
            )?;
            Ok(0)
        });
        let mut module = instance(&runtime, "bad");
        module.prepare(&["bad".to_string()]).unwrap();
        module.invoke().unwrap();

        let err = read_output(module.as_mut(), 0, &OutputSpec::image()).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedType(_)));
    }

    #[test]
    fn test_image_filesystem_layout() {
        let runtime = NativeRuntime::new();
        runtime.register("noop", |_: &mut NativeContext<'_>| Ok(0));
        let mut module = instance(&runtime, "noop");
        module.prepare(&["noop".to_string()]).unwrap();

        let image = sample_image();
        let input = PipelineInput::at_path(DataDescriptor::Image(image.clone()), "/inputs/image");
        write_input(module.as_mut(), 0, &input).unwrap();

        let fs = VirtualFs::new(module.filesystem());
        assert!(fs.exists("/inputs/image/index.json"));
        assert_eq!(fs.read("/inputs/image/data/data.raw").unwrap(), image.data.as_bytes());
        assert!(fs.exists("/inputs/image/data/direction.raw"));
        let index: Value = serde_json::from_slice(&fs.read("/inputs/image/index.json").unwrap()).unwrap();
        assert_eq!(index["data"], "data/data.raw");

        let spec = OutputSpec::Image {
            path: Some("/inputs/image".to_string()),
        };
        let output = read_output(module.as_mut(), 0, &spec).unwrap();
        assert_eq!(output.as_image(), Some(&image));
    }

    #[test]
    fn test_mesh_filesystem_layout_names() {
        let runtime = NativeRuntime::new();
        runtime.register("noop", |_: &mut NativeContext<'_>| Ok(0));
        let mut module = instance(&runtime, "noop");
        module.prepare(&["noop".to_string()]).unwrap();

        let mesh = Mesh::new(MeshType::default());
        let input = PipelineInput::at_path(DataDescriptor::Mesh(mesh), "mesh");
        write_input(module.as_mut(), 0, &input).unwrap();

        let fs = VirtualFs::new(module.filesystem());
        for name in ["points", "cells", "pointData", "cellData"] {
            assert!(fs.exists(&format!("mesh/data/{name}.raw")), "{name}.raw missing");
        }
    }

    #[test]
    fn test_text_file_input_lands_in_sandbox() {
        let runtime = NativeRuntime::new();
        runtime.register("noop", |_: &mut NativeContext<'_>| Ok(0));
        let mut module = instance(&runtime, "noop");
        module.prepare(&["noop".to_string()]).unwrap();

        let input = DataDescriptor::TextFile(TextFile {
            path: "/notes/readme.txt".to_string(),
            data: "hello".to_string(),
        });
        write_input(module.as_mut(), 0, &input.into()).unwrap();

        let output = read_output(
            module.as_mut(),
            0,
            &OutputSpec::TextFile {
                path: "/notes/readme.txt".to_string(),
            },
        )
        .unwrap();
        match output {
            DataDescriptor::TextFile(file) => assert_eq!(file.data, "hello"),
            other => panic!("Expected TextFile, got {}", other.type_name()),
        }
    }
}
