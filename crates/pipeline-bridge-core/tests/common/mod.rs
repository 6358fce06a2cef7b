//! Common test utilities: an in-memory fetcher and native stand-ins for IO modules

#![allow(dead_code)]

use async_trait::async_trait;
use pipeline_bridge_core::loader::entry_name;
use pipeline_bridge_core::{
    BinaryFile, BridgeConfig, BridgeError, DataDescriptor, ElementType, Image, ImageType,
    ModuleFetcher, NativeContext, NativePipeline, NativeRuntime, PipelineBridge, PipelineInput,
    PixelType, Result, TypedBuffer,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Serves the same payload for every location and records what was asked for
#[derive(Default)]
pub struct MemoryFetcher {
    fetched: Mutex<Vec<String>>,
    payload: Vec<u8>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self {
            fetched: Mutex::new(Vec::new()),
            payload,
        }
    }

    /// Locations fetched so far, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    /// Entry names of the modules fetched so far, in order
    pub fn fetched_modules(&self) -> Vec<String> {
        self.fetched()
            .iter()
            .map(|location| entry_name(location).to_string())
            .collect()
    }
}

#[async_trait]
impl ModuleFetcher for MemoryFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(location.to_string());
        if location.contains("unreachable") {
            return Err(BridgeError::ModuleLoad {
                path: location.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.payload.clone())
    }
}

pub struct TestBridge {
    pub bridge: PipelineBridge,
    pub runtime: NativeRuntime,
    pub fetcher: Arc<MemoryFetcher>,
}

/// Bridge over native pipelines with the default configuration
pub fn test_bridge() -> TestBridge {
    let runtime = NativeRuntime::new();
    let fetcher = Arc::new(MemoryFetcher::new());
    let bridge = PipelineBridge::with_runtime(
        BridgeConfig::default(),
        fetcher.clone(),
        Arc::new(runtime.clone()),
    );
    TestBridge {
        bridge,
        runtime,
        fetcher,
    }
}

/// 4x4 uint8 image, unit spacing, zero origin, identity direction
pub fn sample_image(fill: impl Fn(u8) -> u8) -> Image {
    let mut image = Image::new(ImageType {
        dimension: 2,
        component_type: ElementType::UInt8,
        pixel_type: PixelType::Scalar,
        components: 1,
    });
    image.size = vec![4, 4];
    image.spacing = vec![1.0, 1.0];
    image.origin = vec![0.0, 0.0];
    let pixels: Vec<u8> = (0..16).map(&fill).collect();
    image.data = TypedBuffer::from_u8s(&pixels);
    image
}

pub fn binary_file(path: &str, bytes: &[u8]) -> PipelineInput {
    DataDescriptor::BinaryFile(BinaryFile {
        path: path.to_string(),
        data: TypedBuffer::from_u8s(bytes),
    })
    .into()
}

// ============================================================================
// A toy image container: magic, JSON header, pixel data, direction
// ============================================================================

fn push_section(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take_section<'a>(bytes: &mut &'a [u8]) -> Option<&'a [u8]> {
    let current: &'a [u8] = *bytes;
    let len = u32::from_le_bytes(current.get(..4)?.try_into().ok()?) as usize;
    let section = current.get(4..4 + len)?;
    *bytes = &current[4 + len..];
    Some(section)
}

pub fn pack(magic: &[u8], header: &Value, data: &[u8], direction: &[u8]) -> Vec<u8> {
    let mut out = magic.to_vec();
    push_section(&mut out, &serde_json::to_vec(header).unwrap());
    push_section(&mut out, data);
    push_section(&mut out, direction);
    out
}

pub fn unpack(bytes: &[u8], magic: &[u8]) -> Option<(Value, Vec<u8>, Vec<u8>)> {
    let mut rest = bytes.strip_prefix(magic)?;
    let header = serde_json::from_slice(take_section(&mut rest)?).ok()?;
    let data = take_section(&mut rest)?.to_vec();
    let direction = take_section(&mut rest)?.to_vec();
    Some((header, data, direction))
}

/// File contents a toy reader with `magic` accepts
pub fn encode_image(magic: &[u8], image: &Image) -> Vec<u8> {
    let header = serde_json::to_value(image).unwrap();
    pack(
        magic,
        &header,
        image.data.as_bytes(),
        image.direction.as_bytes(),
    )
}

/// Reader for the toy container: argv = [name, file, "0", ...]; returns 1 on foreign files
pub fn image_reader(magic: &'static [u8]) -> impl NativePipeline {
    move |ctx: &mut NativeContext<'_>| -> std::result::Result<i32, String> {
        let file_name = ctx.argv().get(1).cloned().ok_or("missing input file argument")?;
        let bytes = ctx.read_file(&file_name)?;
        let Some((mut header, data, direction)) = unpack(&bytes, magic) else {
            ctx.eprint("unrecognized file format");
            return Ok(1);
        };
        header["data"] = Value::String(ctx.set_output_array(0, 0, &data)?);
        header["direction"] = Value::String(ctx.set_output_array(0, 1, &direction)?);
        ctx.set_output_json(0, &header)?;
        Ok(0)
    }
}

/// Writer for the toy container: argv = [name, "0", file, ...]
pub fn image_writer(magic: &'static [u8]) -> impl NativePipeline {
    move |ctx: &mut NativeContext<'_>| -> std::result::Result<i32, String> {
        let file_name = ctx.argv().get(2).cloned().ok_or("missing output file argument")?;
        let header = ctx.input_json(0)?;
        let data = ctx.input_array(0, 0)?;
        let direction = ctx.input_array(0, 1)?;
        ctx.write_file(&file_name, &pack(magic, &header, &data, &direction))?;
        Ok(0)
    }
}

/// Copies mesh points into a poly data surface
pub fn mesh_to_poly_data(ctx: &mut NativeContext<'_>) -> std::result::Result<i32, String> {
    let mesh = ctx.input_json(0)?;
    let points = ctx.input_array(0, 0)?;
    let mut refs = Vec::new();
    refs.push(ctx.set_output_array(0, 0, &points)?);
    for sub in 1..7 {
        refs.push(ctx.set_output_array(0, sub, &[])?);
    }
    ctx.set_output_json(
        0,
        &serde_json::json!({
            "polyDataType": {
                "pointPixelComponentType": "float32",
                "pointPixelType": "Scalar",
                "pointPixelComponents": 1,
                "cellPixelComponentType": "float32",
                "cellPixelType": "Scalar",
                "cellPixelComponents": 1
            },
            "name": "surface",
            "numberOfPoints": mesh["numberOfPoints"],
            "points": refs[0],
            "verticesBufferSize": 0,
            "vertices": refs[1],
            "linesBufferSize": 0,
            "lines": refs[2],
            "polygonsBufferSize": 0,
            "polygons": refs[3],
            "triangleStripsBufferSize": 0,
            "triangleStrips": refs[4],
            "numberOfPointPixels": 0,
            "pointData": refs[5],
            "numberOfCellPixels": 0,
            "cellData": refs[6]
        }),
    )?;
    Ok(0)
}

/// Prints its argv and reports the file contents as a single patient name tag
pub fn dicom_tags(ctx: &mut NativeContext<'_>) -> std::result::Result<i32, String> {
    let line = ctx.argv().join(" ");
    ctx.print(&line);
    let path = ctx.argv().get(1).cloned().ok_or("missing input file argument")?;
    let bytes = ctx.read_file(&path)?;
    let tags = serde_json::json!([["0010|0010", String::from_utf8_lossy(&bytes)]]);
    ctx.set_output_text(0, &tags.to_string())?;
    Ok(0)
}
