//! Transfer optimizer: buffers of a result that can be handed off without copying

use crate::executor::ExecutionResult;
use crate::types::{BufferStorage, DataDescriptor, TypedBuffer};
use std::sync::Arc;

/// Owned, non-empty buffers of every output, each listed once
///
/// Buffers marked [`BufferStorage::Shared`] are left out; callers read those
/// in place instead.
pub fn collect_transferable(result: &ExecutionResult) -> Vec<Arc<[u8]>> {
    collect_from_outputs(&result.outputs)
}

pub fn collect_from_outputs(outputs: &[DataDescriptor]) -> Vec<Arc<[u8]>> {
    let mut transferable: Vec<Arc<[u8]>> = Vec::new();
    for buffer in outputs.iter().flat_map(buffers) {
        let BufferStorage::Owned(bytes) = buffer.storage() else {
            continue;
        };
        if bytes.is_empty() || transferable.iter().any(|seen| Arc::ptr_eq(seen, bytes)) {
            continue;
        }
        transferable.push(Arc::clone(bytes));
    }
    transferable
}

/// Every buffer-bearing field of a descriptor
fn buffers(descriptor: &DataDescriptor) -> Vec<&TypedBuffer> {
    match descriptor {
        DataDescriptor::TextStream(_) | DataDescriptor::TextFile(_) => Vec::new(),
        DataDescriptor::BinaryStream(stream) => vec![&stream.data],
        DataDescriptor::BinaryFile(file) => vec![&file.data],
        DataDescriptor::Image(image) => vec![&image.data, &image.direction],
        DataDescriptor::Mesh(mesh) => vec![
            &mesh.points,
            &mesh.cells,
            &mesh.point_data,
            &mesh.cell_data,
        ],
        DataDescriptor::PolyData(poly_data) => vec![
            &poly_data.points,
            &poly_data.vertices,
            &poly_data.lines,
            &poly_data.polygons,
            &poly_data.triangle_strips,
            &poly_data.point_data,
            &poly_data.cell_data,
        ],
    }
}
