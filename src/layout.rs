//! Computes the self-referential cluster layout: every header region offset
//! plus the absolute position of each chunk's data, matching what the reader
//! recovers from the embedded counts.

use crate::format::{HailstormChunk, HailstormHeader, HailstormPaths, HailstormResource};
use crate::mem::align_up;

/// Byte offsets of every cluster region and the total cluster size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClusterLayout {
    pub paths_descriptor: u64,
    pub chunks: u64,
    pub resources: u64,
    /// Exact end of the resource table, stored as `header_size`.
    pub header_size: u64,
    pub paths_data: u64,
    /// Start of chunk data, also the end of the path data region.
    pub data: u64,
    pub total_size: u64,
}

impl ClusterLayout {
    /// Lays out the cluster for the given chunk list and path table size,
    /// assigning each chunk its absolute data offset. `paths_size` must
    /// already be padded to 8 bytes.
    pub fn compute(
        resource_count: u32,
        chunks: &mut [HailstormChunk],
        paths_size: u64,
    ) -> ClusterLayout {
        debug_assert_eq!(paths_size % 8, 0);

        let header_end = std::mem::size_of::<HailstormHeader>() as u64;
        let paths_descriptor = align_up(header_end, 8);
        let chunks_offset = align_up(
            paths_descriptor + std::mem::size_of::<HailstormPaths>() as u64,
            8,
        );
        let chunk_record = std::mem::size_of::<HailstormChunk>() as u64;
        let resources = align_up(chunks_offset + chunk_record * chunks.len() as u64, 4);
        let resource_record = std::mem::size_of::<HailstormResource>() as u64;
        let header_size = resources + resource_record * resource_count as u64;
        let paths_data = align_up(header_size, 8);
        let data = paths_data + paths_size;

        // Chunks are laid back to back, each start realigned to 8. The final
        // chunk is padded the same way so the total size can serve as the
        // base header offset of a concatenated cluster.
        let mut offset = data;
        for chunk in chunks.iter_mut() {
            chunk.offset = offset.into();
            // The builder stores chunks verbatim, so the logical size equals
            // the stored size.
            chunk.size_origin = chunk.size;
            offset = align_up(offset + chunk.size.get(), 8);
        }

        ClusterLayout {
            paths_descriptor,
            chunks: chunks_offset,
            resources,
            header_size,
            paths_data,
            data,
            total_size: offset,
        }
    }
}
