//! Cluster writer. One driver computes the layout and emits every region in
//! a fixed order through a sink seam; the in-memory sink materialises a
//! single buffer owned by the cluster allocator, the streaming sink hands
//! every write to the caller as an offset addressed callback.

use log::{debug, error};
use zerocopy::{FromZeros, IntoBytes};

use crate::array::Array;
use crate::assign::{assign_chunks, Assignment, METADATA_ALIGN, NO_ENTRY};
use crate::format::{
    ChunkType, HailstormChunk, HailstormHeader, HailstormHeaderBase, HailstormPaths,
    HailstormResource, Persistence, HEADER_VERSION_V0, MAGIC,
};
use crate::layout::ClusterLayout;
use crate::mem::{align_up, Allocator, Data, Memory, ResourceData, SystemAllocator};
use crate::Error;

/// Upper chunk size produced by the default create policy. A resource that
/// does not fit gets an oversize exclusive chunk instead.
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Alignment of the in-memory cluster buffer.
const CLUSTER_ALIGN: usize = 8;

/// Destination chunks chosen by the select policy for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteChunkRef {
    /// Chunk index where resource data should be stored.
    pub data_chunk: u16,
    /// Chunk index where resource metadata should be stored.
    pub meta_chunk: u16,
    /// Request a new chunk, created with `data_chunk` as its base. The
    /// resource is then re-selected against the grown chunk list.
    pub data_create: bool,
    /// Request a new metadata chunk, created with `meta_chunk` as its base.
    pub meta_create: bool,
}

/// Role of the produced cluster in a pack family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackKind {
    #[default]
    Base,
    /// Additional data extending a base pack, shares its `pack_id`.
    Expansion,
    /// Updated versions of existing resources, shares the base `pack_id`.
    Patch,
}

/// Pack identity stored in the produced header.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackInfo {
    /// Unique for base packs; expansions and patches carry the id of the
    /// base pack they apply to.
    pub pack_id: u32,
    /// 0 for base packs, growing per expansion or patch on the same id.
    pub pack_order: u32,
    pub kind: PackKind,
    /// The pack can be consumed without further transformation.
    pub is_baked: bool,
    /// Application version that produced the pack.
    pub version: [u8; 3],
}

/// Everything to be stored in one cluster. `paths` and `data` are parallel;
/// `metadata` is parallel too unless `metadata_mapping` is given, in which
/// case the mapping is parallel to `paths` and indexes into `metadata`,
/// allowing several resources to share one stored metadata blob.
pub struct WriteData<'a> {
    pub paths: &'a [&'a str],
    pub data: &'a [ResourceData<'a>],
    pub metadata: &'a [Data<'a>],
    pub metadata_mapping: &'a [u32],
    /// Application custom values copied into the header.
    pub custom_values: [u32; 4],
    pub pack_info: PackInfo,
}

impl Default for WriteData<'_> {
    fn default() -> Self {
        WriteData {
            paths: &[],
            data: &[],
            metadata: &[],
            metadata_mapping: &[],
            custom_values: [0; 4],
            pack_info: PackInfo::default(),
        }
    }
}

/// Allocators and chunk seeding for a cluster write.
pub struct WriteParams<'a> {
    /// Scratch allocations, all released before the write returns.
    pub temp_alloc: &'a dyn Allocator,
    /// Owns the final cluster buffer. Unused by the streaming write.
    pub cluster_alloc: &'a dyn Allocator,
    /// Chunks seeded into the cluster before assignment starts. The list is
    /// not curated, unused chunks end up in the cluster verbatim. This is
    /// also the only way to get `AppSpecific` chunks into a cluster.
    pub initial_chunks: &'a [HailstormChunk],
    /// Estimated final chunk count, sizes the scratch arrays.
    pub estimated_chunk_count: u32,
}

impl Default for WriteParams<'_> {
    fn default() -> Self {
        WriteParams {
            temp_alloc: &SystemAllocator,
            cluster_alloc: &SystemAllocator,
            initial_chunks: &[],
            estimated_chunk_count: 0,
        }
    }
}

/// Chunk placement and data production hooks for a cluster write. The
/// default methods implement the stock behaviour: data and metadata always
/// go to the last chunk, and chunks are mixed, regular, 8 aligned and at
/// most [`DEFAULT_CHUNK_SIZE`] big.
pub trait WritePolicy {
    /// Chooses the destination chunks for one resource. Returned indices
    /// must be valid for `chunks`; set the create flags to grow the list
    /// instead. When metadata is shared the returned `meta_chunk` may be
    /// overridden in favour of the chunk that already holds the entry.
    fn select_chunk(
        &mut self,
        meta: Data<'_>,
        data: ResourceData<'_>,
        chunks: &[HailstormChunk],
    ) -> WriteChunkRef {
        let _ = (meta, data);
        let last = (chunks.len() - 1) as u16;
        WriteChunkRef {
            data_chunk: last,
            meta_chunk: last,
            ..WriteChunkRef::default()
        }
    }

    /// Defines a new chunk. `base` is the chunk the resource was aimed at,
    /// or zeroed when the cluster starts empty. The returned chunk must be
    /// `Mixed` when data and metadata share it, `Data` or `Metadata`
    /// otherwise, and may be any size at least as large as requested; the
    /// assignment engine never exceeds it.
    fn create_chunk(
        &mut self,
        meta: Data<'_>,
        data: ResourceData<'_>,
        base: HailstormChunk,
    ) -> HailstormChunk {
        let mut chunk = base;
        if chunk.size.get() == 0 {
            chunk = HailstormChunk::new(
                ChunkType::Mixed,
                Persistence::Regular,
                8,
                DEFAULT_CHUNK_SIZE,
            );
        }
        let required = meta.size() + data.size();
        if required > DEFAULT_CHUNK_SIZE {
            chunk.size.set(required);
            chunk.align.set(data.align());
        }
        chunk
    }

    /// Produces the bytes of a deferred resource straight into its final
    /// location. Only called by the in-memory write for resources passed as
    /// [`ResourceData::Deferred`].
    fn write_resource(&mut self, data: &WriteData<'_>, index: u32, dest: &mut [u8]) -> bool {
        let _ = (data, dest);
        panic!("resource {index} has deferred data but the policy does not write resources");
    }

    /// Fills an `AppSpecific` chunk. Only called by the in-memory write and
    /// only when such chunks were seeded through the initial chunk list.
    fn write_custom_chunk(
        &mut self,
        data: &WriteData<'_>,
        chunk: &HailstormChunk,
        dest: &mut [u8],
    ) -> bool {
        let _ = (data, dest);
        panic!(
            "cluster has an AppSpecific chunk at {} but the policy does not write custom chunks",
            chunk.offset.get()
        );
    }
}

/// The stock placement behaviour with no state.
pub struct DefaultPolicy;

impl WritePolicy for DefaultPolicy {}

/// Destination of a streamed cluster write. Each callback receives the
/// absolute byte offset to write at; offsets are NOT guaranteed to arrive
/// in ascending order, shared metadata and the trailing header regions
/// jump backwards. `close` is called exactly once after a successful
/// `open`, with `success == false` when the write was aborted; no partial
/// cluster may be surfaced in that case.
pub trait ClusterWriter {
    fn open(&mut self, total_size: u64) -> bool;
    fn write_header(&mut self, bytes: &[u8], offset: u64) -> bool;
    fn write_metadata(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool;
    fn write_resource(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool;
    fn write_custom_chunk(
        &mut self,
        data: &WriteData<'_>,
        chunk: &HailstormChunk,
        offset: u64,
    ) -> bool;
    fn close(&mut self, success: bool);
}

/// Sink seam of the driver. Both write modes see the same call sequence.
trait DataSink {
    fn write_span(&mut self, bytes: &[u8], offset: u64) -> bool;
    fn write_metadata(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool;
    fn write_resource(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool;
    fn write_custom_chunk(&mut self, data: &WriteData<'_>, chunk: &HailstormChunk, offset: u64)
        -> bool;
}

/// Builds the cluster in a single allocation; byte copies cannot fail.
struct MemorySink<'m, 'p> {
    memory: Memory<'m>,
    policy: &'p mut dyn WritePolicy,
}

impl DataSink for MemorySink<'_, '_> {
    fn write_span(&mut self, bytes: &[u8], offset: u64) -> bool {
        let start = offset as usize;
        self.memory.as_mut_slice()[start..start + bytes.len()].copy_from_slice(bytes);
        true
    }

    fn write_metadata(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool {
        self.write_span(data.metadata[index as usize].bytes, offset)
    }

    fn write_resource(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool {
        match data.data[index as usize] {
            ResourceData::Inline(blob) => self.write_span(blob.bytes, offset),
            ResourceData::Deferred { size, .. } => {
                let start = offset as usize;
                let dest = &mut self.memory.as_mut_slice()[start..start + size as usize];
                self.policy.write_resource(data, index, dest)
            }
        }
    }

    fn write_custom_chunk(
        &mut self,
        data: &WriteData<'_>,
        chunk: &HailstormChunk,
        offset: u64,
    ) -> bool {
        let start = offset as usize;
        let dest = &mut self.memory.as_mut_slice()[start..start + chunk.size.get() as usize];
        self.policy.write_custom_chunk(data, chunk, dest)
    }
}

/// Delegates every write to the caller's [`ClusterWriter`].
struct StreamSink<'w> {
    writer: &'w mut dyn ClusterWriter,
}

impl DataSink for StreamSink<'_> {
    fn write_span(&mut self, bytes: &[u8], offset: u64) -> bool {
        self.writer.write_header(bytes, offset)
    }

    fn write_metadata(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool {
        self.writer.write_metadata(data, index, offset)
    }

    fn write_resource(&mut self, data: &WriteData<'_>, index: u32, offset: u64) -> bool {
        self.writer.write_resource(data, index, offset)
    }

    fn write_custom_chunk(
        &mut self,
        data: &WriteData<'_>,
        chunk: &HailstormChunk,
        offset: u64,
    ) -> bool {
        self.writer.write_custom_chunk(data, chunk, offset)
    }
}

fn validate(write_data: &WriteData<'_>) -> Result<(), Error> {
    let count = write_data.paths.len();
    assert_eq!(
        count,
        write_data.data.len(),
        "paths and data lists must be parallel"
    );
    assert!(
        write_data.metadata_mapping.is_empty() || write_data.metadata_mapping.len() == count,
        "metadata mapping must be empty or parallel to paths"
    );
    if write_data.metadata_mapping.is_empty() {
        assert_eq!(
            count,
            write_data.metadata.len(),
            "paths and metadata lists must be parallel"
        );
    }

    if count > u16::MAX as usize {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn build_header(
    write_data: &WriteData<'_>,
    assignment: &Assignment<'_>,
    layout: &ClusterLayout,
) -> HailstormHeader {
    let info = &write_data.pack_info;
    let mut flags = match info.kind {
        PackKind::Base => 0,
        PackKind::Expansion => HailstormHeader::FLAG_EXPANSION,
        PackKind::Patch => HailstormHeader::FLAG_PATCH,
    };
    if info.is_baked {
        flags |= HailstormHeader::FLAG_BAKED;
    }

    HailstormHeader {
        base: HailstormHeaderBase {
            magic: MAGIC.into(),
            header_version: HEADER_VERSION_V0.into(),
            header_size: layout.header_size.into(),
        },
        offset_next: layout.total_size.into(),
        offset_data: layout.data.into(),
        version: info.version,
        flags,
        count_chunks: (assignment.chunks.len() as u16).into(),
        count_resources: (write_data.paths.len() as u16).into(),
        pack_id: info.pack_id.into(),
        pack_order: info.pack_order.into(),
        app_custom_values: write_data.custom_values.map(Into::into),
    }
}

/// Emits every cluster region in order. The `used` and `meta_tracker` state
/// from the assignment pass is reset and replayed so data lands exactly
/// where the assignment accounted for it.
fn drive(
    sink: &mut dyn DataSink,
    write_data: &WriteData<'_>,
    assignment: &mut Assignment<'_>,
    layout: &ClusterLayout,
    header: &HailstormHeader,
    paths_info: &HailstormPaths,
    temp_alloc: &dyn Allocator,
) -> bool {
    debug!("header at 0, {} chunks", assignment.chunks.len());
    if !sink.write_span(header.as_bytes(), 0) {
        return false;
    }
    if !sink.write_span(paths_info.as_bytes(), layout.paths_descriptor) {
        return false;
    }
    if !sink.write_span(assignment.chunks.as_bytes(), layout.chunks) {
        return false;
    }

    let Assignment {
        chunks,
        refs,
        used,
        meta_tracker,
        ..
    } = assignment;
    used.fill(0);
    meta_tracker.fill(NO_ENTRY);

    let res_count = write_data.paths.len();
    let mut resources: Array<HailstormResource> = Array::new(temp_alloc);
    resources.resize(res_count, HailstormResource::new_zeroed());
    let mut paths_scratch: Array<u8> = Array::new(temp_alloc);
    paths_scratch.reserve(paths_info.size.get() as usize);

    debug!("{res_count} resources");
    for idx in 0..res_count {
        let chunk_ref = refs[idx];
        let meta_idx = if meta_tracker.is_empty() {
            idx
        } else {
            write_data.metadata_mapping[idx] as usize
        };

        // First occurrence writes the metadata, later references copy the
        // recorded location.
        let meta_offset;
        let meta_size;
        if meta_tracker.is_empty() || meta_tracker[meta_idx] == NO_ENTRY {
            let meta = write_data.metadata[meta_idx];
            let mc = chunk_ref.meta_chunk as usize;
            let place = align_up(used[mc], METADATA_ALIGN);
            meta_offset = place;
            meta_size = meta.size();
            if !sink.write_metadata(write_data, meta_idx as u32, chunks[mc].offset.get() + place) {
                return false;
            }
            used[mc] = place + meta.size();
            if !meta_tracker.is_empty() {
                meta_tracker[meta_idx] = idx as u32;
            }
        } else {
            let first = meta_tracker[meta_idx] as usize;
            meta_offset = resources[first].meta_offset.get() as u64;
            meta_size = resources[first].meta_size.get() as u64;
        }

        let data = write_data.data[idx];
        let dc = chunk_ref.data_chunk as usize;
        let place = align_up(used[dc], data.align() as u64);
        if !sink.write_resource(write_data, idx as u32, chunks[dc].offset.get() + place) {
            return false;
        }
        used[dc] = place + data.size();

        let path = write_data.paths[idx];
        let resource = &mut resources[idx];
        resource.chunk = chunk_ref.data_chunk.into();
        resource.meta_chunk = chunk_ref.meta_chunk.into();
        resource.offset = (place as u32).into();
        resource.size = (data.size() as u32).into();
        resource.meta_offset = (meta_offset as u32).into();
        resource.meta_size = (meta_size as u32).into();
        resource.path_offset = (paths_scratch.len() as u32).into();
        resource.path_size = (path.len() as u32).into();
        paths_scratch.push_slice(path.as_bytes());
        paths_scratch.push(0);
    }

    for idx in 0..chunks.len() {
        let chunk = chunks[idx];
        if chunk.chunk_type() == ChunkType::AppSpecific {
            debug!("custom chunk {idx} at {}", chunk.offset.get());
            if !sink.write_custom_chunk(write_data, &chunk, chunk.offset.get()) {
                return false;
            }
        }
    }

    // Zero-fill the path blob up to its padded size before it goes out.
    paths_scratch.resize(paths_info.size.get() as usize, 0);

    debug!("paths and resource table");
    if !sink.write_span(paths_scratch.as_slice(), layout.paths_data) {
        return false;
    }
    if !sink.write_span(resources.as_bytes(), layout.resources) {
        return false;
    }
    true
}

/// Creates a new hailstorm cluster in memory and returns the buffer, owned
/// by the cluster allocator of `params`. Returns `None` when the input is
/// rejected or a policy callback fails; no partial cluster is surfaced.
pub fn write_cluster<'a>(
    params: &WriteParams<'a>,
    policy: &mut dyn WritePolicy,
    write_data: &WriteData<'_>,
) -> Option<Memory<'a>> {
    if let Err(err) = validate(write_data) {
        error!("write_cluster: {err}");
        return None;
    }

    let mut assignment = assign_chunks(params.temp_alloc, params, policy, write_data);
    if assignment.chunks.len() > u16::MAX as usize {
        error!(
            "write_cluster: {} chunks exceed the format limit",
            assignment.chunks.len()
        );
        return None;
    }
    if assignment.needs_resource_writer {
        debug!("cluster uses deferred resource data");
    }

    let layout = ClusterLayout::compute(
        write_data.paths.len() as u32,
        assignment.chunks.as_mut_slice(),
        assignment.paths_size,
    );
    let Ok(total_size) = usize::try_from(layout.total_size) else {
        error!("write_cluster: {}", Error::LargePackNotSupported);
        return None;
    };

    let header = build_header(write_data, &assignment, &layout);
    let paths_info = HailstormPaths {
        offset: layout.paths_data.into(),
        size: assignment.paths_size.into(),
    };

    let Some(memory) = Memory::allocate(params.cluster_alloc, total_size, CLUSTER_ALIGN) else {
        error!("write_cluster: cluster allocation of {total_size} bytes failed");
        return None;
    };

    let mut sink = MemorySink { memory, policy };
    if drive(
        &mut sink,
        write_data,
        &mut assignment,
        &layout,
        &header,
        &paths_info,
        params.temp_alloc,
    ) {
        Some(sink.memory)
    } else {
        None
    }
}

/// Creates a new hailstorm cluster through the caller's [`ClusterWriter`].
/// The layout pass and the emitted write sequence are identical to
/// [`write_cluster`], only the destination differs. Returns `false` when
/// the input is rejected, `open` fails or any write callback fails.
pub fn write_cluster_async(
    params: &WriteParams<'_>,
    policy: &mut dyn WritePolicy,
    writer: &mut dyn ClusterWriter,
    write_data: &WriteData<'_>,
) -> bool {
    if let Err(err) = validate(write_data) {
        error!("write_cluster_async: {err}");
        return false;
    }

    let mut assignment = assign_chunks(params.temp_alloc, params, policy, write_data);
    if assignment.chunks.len() > u16::MAX as usize {
        error!(
            "write_cluster_async: {} chunks exceed the format limit",
            assignment.chunks.len()
        );
        return false;
    }

    let layout = ClusterLayout::compute(
        write_data.paths.len() as u32,
        assignment.chunks.as_mut_slice(),
        assignment.paths_size,
    );
    let header = build_header(write_data, &assignment, &layout);
    let paths_info = HailstormPaths {
        offset: layout.paths_data.into(),
        size: assignment.paths_size.into(),
    };

    if !writer.open(layout.total_size) {
        error!("write_cluster_async: open rejected the cluster");
        return false;
    }

    let success = {
        let mut sink = StreamSink { writer: &mut *writer };
        drive(
            &mut sink,
            write_data,
            &mut assignment,
            &layout,
            &header,
            &paths_info,
            params.temp_alloc,
        )
    };
    writer.close(success);
    success
}
