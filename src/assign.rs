//! Two-pass chunk assignment. The first pass walks every resource, asks the
//! select policy for destination chunks, tracks per-chunk used bytes and
//! grows the chunk list through the create policy whenever a destination
//! overflows. The emit pass in the writer replays the same bookkeeping to
//! produce identical offsets.

use log::debug;
use zerocopy::FromZeros;

use crate::array::Array;
use crate::format::{ChunkType, HailstormChunk};
use crate::mem::{align_up, Allocator, Data, ResourceData};
use crate::writer::{WriteChunkRef, WriteData, WriteParams, WritePolicy};

/// Marks a shared metadata entry that has not been placed in a chunk yet.
pub(crate) const NO_ENTRY: u32 = u32::MAX;

/// Metadata is packed to an 8 byte boundary inside its chunk.
pub(crate) const METADATA_ALIGN: u64 = 8;

/// Result of the assignment pass. `refs`, `used` and `meta_tracker` are
/// consumed again by the emit pass; `used` and `meta_tracker` get reset
/// there and replayed.
pub(crate) struct Assignment<'t> {
    pub chunks: Array<'t, HailstormChunk>,
    pub refs: Array<'t, WriteChunkRef>,
    pub used: Array<'t, u64>,
    pub meta_tracker: Array<'t, u32>,
    pub paths_size: u64,
    pub needs_resource_writer: bool,
}

pub(crate) fn assign_chunks<'t>(
    temp_alloc: &'t dyn Allocator,
    params: &WriteParams<'_>,
    policy: &mut dyn WritePolicy,
    write_data: &WriteData<'_>,
) -> Assignment<'t> {
    let res_count = write_data.paths.len();

    let mut chunks: Array<HailstormChunk> = Array::new(temp_alloc);
    chunks.reserve(params.estimated_chunk_count as usize);
    chunks.push_slice(params.initial_chunks);

    let mut used: Array<u64> = Array::new(temp_alloc);
    used.resize(chunks.len(), 0);

    // Mint the first chunk on demand. An input without resources keeps the
    // chunk list exactly as provided, possibly empty.
    if chunks.is_empty() && res_count > 0 {
        let first = policy.create_chunk(
            Data::empty(8),
            ResourceData::Inline(Data::empty(8)),
            HailstormChunk::new_zeroed(),
        );
        chunks.push(first);
        used.push(0);
    }

    let mut refs: Array<WriteChunkRef> = Array::new(temp_alloc);
    refs.resize(res_count, WriteChunkRef::default());

    let mut meta_tracker: Array<u32> = Array::new(temp_alloc);
    meta_tracker.resize(write_data.metadata_mapping.len(), NO_ENTRY);

    // The path blob always ends with at least an 8 byte NUL run.
    let mut paths_size: u64 = if res_count > 0 { 8 } else { 0 };
    let mut needs_resource_writer = false;

    let mut idx = 0;
    while idx < res_count {
        let meta_idx = if meta_tracker.is_empty() {
            idx
        } else {
            write_data.metadata_mapping[idx] as usize
        };
        let meta = write_data.metadata[meta_idx];
        let data = write_data.data[idx];
        needs_resource_writer |= data.bytes().is_none();

        let mut chunk_ref = policy.select_chunk(meta, data, chunks.as_slice());
        let mut shared_metadata = false;

        if !chunk_ref.data_create && !chunk_ref.meta_create {
            assert!(
                (chunk_ref.data_chunk as usize) < chunks.len(),
                "select policy returned data chunk {} of {}",
                chunk_ref.data_chunk,
                chunks.len()
            );
            assert!(
                (chunk_ref.meta_chunk as usize) < chunks.len(),
                "select policy returned meta chunk {} of {}",
                chunk_ref.meta_chunk,
                chunks.len()
            );

            // Shared metadata reuses the chunk of the resource that placed
            // the entry first.
            if !meta_tracker.is_empty() && meta_tracker[meta_idx] != NO_ENTRY {
                shared_metadata = true;
                chunk_ref.meta_chunk = refs[meta_tracker[meta_idx] as usize].meta_chunk;
            }

            let dc = chunk_ref.data_chunk as usize;
            let mc = chunk_ref.meta_chunk as usize;

            // The alignment reserve is conservative and independent of the
            // padding actually required, which can split a chunk early. A
            // fresh chunk needs no reserve, its start is aligned already.
            let data_reserve = if used[dc] == 0 { 0 } else { data.align() as u64 };
            let data_remaining = chunks[dc]
                .size
                .get()
                .saturating_sub(used[dc] + data_reserve);

            if dc == mc {
                let meta_needed = if shared_metadata { 0 } else { meta.size() };
                chunk_ref.data_create = data_remaining.saturating_sub(meta_needed) < data.size();
                // Only one chunk gets created when data and meta share it.
                chunk_ref.meta_create = false;
            } else {
                chunk_ref.data_create = data_remaining < data.size();
                if !shared_metadata {
                    let meta_reserve = if used[mc] == 0 { 0 } else { METADATA_ALIGN };
                    let meta_remaining = chunks[mc]
                        .size
                        .get()
                        .saturating_sub(used[mc] + meta_reserve);
                    chunk_ref.meta_create = meta_remaining < meta.size();
                }
            }
        }

        if chunk_ref.data_create {
            let base = chunks[chunk_ref.data_chunk as usize];
            let mut new_chunk = policy.create_chunk(meta, data, base);
            new_chunk.offset.set(0);
            new_chunk.size_origin.set(0);
            new_chunk.count_entries.set(0);

            let expected = if chunk_ref.data_chunk == chunk_ref.meta_chunk {
                ChunkType::Mixed
            } else {
                ChunkType::Data
            };
            assert!(
                new_chunk.chunk_type() == expected,
                "create policy returned a {:?} chunk, expected {:?}",
                new_chunk.chunk_type(),
                expected
            );

            debug!(
                "chunk {}: {:?}, size {}",
                chunks.len(),
                new_chunk.chunk_type(),
                new_chunk.size.get()
            );
            chunks.push(new_chunk);
            used.push(0);
        }

        if chunk_ref.meta_create {
            assert!(!shared_metadata);
            let base = chunks[chunk_ref.meta_chunk as usize];
            let mut new_chunk = policy.create_chunk(meta, data, base);
            new_chunk.offset.set(0);
            new_chunk.size_origin.set(0);
            new_chunk.count_entries.set(0);

            assert!(
                new_chunk.chunk_type() == ChunkType::Metadata,
                "create policy returned a {:?} chunk, expected Metadata",
                new_chunk.chunk_type()
            );

            debug!("chunk {}: Metadata, size {}", chunks.len(), new_chunk.size.get());
            chunks.push(new_chunk);
            used.push(0);
        }

        // If chunks were created, redo the selection for this resource.
        if chunk_ref.data_create || chunk_ref.meta_create {
            continue;
        }

        // Only update the tracker once the final chunk pair is known.
        if !meta_tracker.is_empty() && meta_tracker[meta_idx] == NO_ENTRY {
            meta_tracker[meta_idx] = idx as u32;
        }
        refs[idx] = chunk_ref;

        let dc = chunk_ref.data_chunk as usize;
        let mc = chunk_ref.meta_chunk as usize;
        assert!(chunks[dc].chunk_type().holds_data());
        assert!(chunks[mc].chunk_type().holds_metadata());
        assert!(
            data.align() <= chunks[dc].align.get(),
            "resource alignment {} exceeds chunk alignment {}",
            data.align(),
            chunks[dc].align.get()
        );

        let entries = chunks[dc].count_entries.get();
        chunks[dc].count_entries.set(entries + 1);

        if !shared_metadata {
            // A placement counts for the meta chunk only when it is a
            // distinct chunk; mixed placements count once.
            if dc != mc {
                let entries = chunks[mc].count_entries.get();
                chunks[mc].count_entries.set(entries + 1);
            }
            used[mc] = align_up(used[mc], METADATA_ALIGN) + meta.size();
        }
        used[dc] = align_up(used[dc], data.align() as u64) + data.size();

        paths_size += write_data.paths[idx].len() as u64 + 1;
        idx += 1;
    }

    paths_size = align_up(paths_size, 8);

    // Shrink every resource chunk to its used size, rounded to the chunk
    // alignment. AppSpecific chunks keep the size their creator requested;
    // the assignment engine never places anything in them.
    for chunk_idx in 0..chunks.len() {
        let chunk = &chunks[chunk_idx];
        let final_size = if chunk.chunk_type() == ChunkType::AppSpecific {
            chunk.size.get()
        } else {
            used[chunk_idx]
        };
        let align = chunk.align.get() as u64;
        chunks[chunk_idx].size.set(align_up(final_size, align));
    }

    Assignment {
        chunks,
        refs,
        used,
        meta_tracker,
        paths_size,
        needs_resource_writer,
    }
}

#[cfg(test)]
mod test_assign_chunks {
    use super::*;
    use crate::format::Persistence;
    use crate::mem::SystemAllocator;
    use crate::writer::DefaultPolicy;

    fn params<'a>(alloc: &'a SystemAllocator, initial: &'a [HailstormChunk]) -> WriteParams<'a> {
        WriteParams {
            temp_alloc: alloc,
            cluster_alloc: alloc,
            initial_chunks: initial,
            estimated_chunk_count: 0,
        }
    }

    fn write_data<'a>(
        paths: &'a [&'a str],
        data: &'a [ResourceData<'a>],
        metadata: &'a [Data<'a>],
        mapping: &'a [u32],
    ) -> WriteData<'a> {
        WriteData {
            paths,
            data,
            metadata,
            metadata_mapping: mapping,
            ..WriteData::default()
        }
    }

    /// Creates fixed-size mixed chunks, so overflow behaviour can be pinned
    /// without multi-megabyte inputs. Selection skips chunks that cannot
    /// hold resources, asking for a mixed chunk instead.
    struct SmallChunks(u64);

    impl WritePolicy for SmallChunks {
        fn select_chunk(
            &mut self,
            _meta: Data<'_>,
            _data: ResourceData<'_>,
            chunks: &[HailstormChunk],
        ) -> WriteChunkRef {
            let last = (chunks.len() - 1) as u16;
            match chunks.iter().rposition(|c| c.chunk_type() == ChunkType::Mixed) {
                Some(idx) => WriteChunkRef {
                    data_chunk: idx as u16,
                    meta_chunk: idx as u16,
                    ..WriteChunkRef::default()
                },
                None => WriteChunkRef {
                    data_chunk: last,
                    meta_chunk: last,
                    data_create: true,
                    meta_create: false,
                },
            }
        }

        fn create_chunk(
            &mut self,
            meta: Data<'_>,
            data: ResourceData<'_>,
            _base: HailstormChunk,
        ) -> HailstormChunk {
            let size = (meta.size() + data.size()).max(self.0);
            HailstormChunk::new(ChunkType::Mixed, Persistence::Regular, 8, size)
        }
    }

    #[test]
    fn single_resource_single_chunk() {
        let alloc = SystemAllocator;
        let data = [ResourceData::Inline(Data::new(b"XY", 1))];
        let metadata = [Data::new(b"M", 1)];
        let input = write_data(&["a"], &data, &metadata, &[]);

        let result = assign_chunks(&alloc, &params(&alloc, &[]), &mut DefaultPolicy, &input);

        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].chunk_type(), ChunkType::Mixed);
        assert_eq!(result.chunks[0].count_entries.get(), 1);
        // Metadata at 0, data right behind it, rounded up to the chunk align.
        assert_eq!(result.used[0], 3);
        assert_eq!(result.chunks[0].size.get(), 8);
        // 8 byte bootstrap + "a" + NUL, padded to 8.
        assert_eq!(result.paths_size, 16);
        assert!(!result.needs_resource_writer);
    }

    #[test]
    fn empty_input_creates_nothing() {
        let alloc = SystemAllocator;
        let input = write_data(&[], &[], &[], &[]);

        let result = assign_chunks(&alloc, &params(&alloc, &[]), &mut DefaultPolicy, &input);

        assert_eq!(result.chunks.len(), 0);
        assert_eq!(result.paths_size, 0);
    }

    #[test]
    fn overflow_splits_into_new_chunk() {
        let alloc = SystemAllocator;
        let blob = [7u8; 40];
        let data = [
            ResourceData::Inline(Data::new(&blob, 8)),
            ResourceData::Inline(Data::new(&blob, 8)),
        ];
        let metadata = [Data::new(b"meta0000", 1), Data::new(b"meta1111", 1)];
        let input = write_data(&["a", "b"], &data, &metadata, &[]);

        let result = assign_chunks(&alloc, &params(&alloc, &[]), &mut SmallChunks(64), &input);

        // 8 meta + 40 data fills a 64 byte chunk beyond recovery for the
        // second resource, which lands in a fresh chunk.
        assert_eq!(result.chunks.len(), 2);
        assert_eq!(result.refs[0].data_chunk, 0);
        assert_eq!(result.refs[1].data_chunk, 1);
        assert_eq!(result.chunks[0].count_entries.get(), 1);
        assert_eq!(result.chunks[1].count_entries.get(), 1);
        assert_eq!(result.chunks[0].size.get(), 48);
    }

    #[test]
    fn exact_fit_create_policy_terminates() {
        // Returns exactly the bytes the resource needs, the smallest size
        // the create contract permits. Every resource must still settle in
        // the chunk minted for it instead of re-triggering creation.
        struct ExactFitMixed;

        impl WritePolicy for ExactFitMixed {
            fn create_chunk(
                &mut self,
                meta: Data<'_>,
                data: ResourceData<'_>,
                _base: HailstormChunk,
            ) -> HailstormChunk {
                HailstormChunk::new(
                    ChunkType::Mixed,
                    Persistence::Regular,
                    8,
                    meta.size() + data.size(),
                )
            }
        }

        let alloc = SystemAllocator;
        let blob = [3u8; 8];
        let data = [
            ResourceData::Inline(Data::new(&blob, 8)),
            ResourceData::Inline(Data::new(&blob, 8)),
        ];
        let metadata = [Data::new(b"meta0000", 1), Data::new(b"meta1111", 1)];
        let input = write_data(&["a", "b"], &data, &metadata, &[]);

        let result = assign_chunks(&alloc, &params(&alloc, &[]), &mut ExactFitMixed, &input);

        // The bootstrap chunk is minted for empty inputs and stays empty;
        // each resource then fills one exact-fit chunk to the last byte.
        assert_eq!(result.chunks.len(), 3);
        assert_eq!(result.chunks[0].size.get(), 0);
        assert_eq!(result.chunks[1].size.get(), 16);
        assert_eq!(result.chunks[2].size.get(), 16);
        assert_eq!(result.refs[0].data_chunk, 1);
        assert_eq!(result.refs[0].meta_chunk, 1);
        assert_eq!(result.refs[1].data_chunk, 2);
        assert_eq!(result.chunks[1].count_entries.get(), 1);
        assert_eq!(result.chunks[2].count_entries.get(), 1);
        assert_eq!(result.used[1], 16);
        assert_eq!(result.used[2], 16);
    }

    #[test]
    fn exact_fit_split_create_policy_terminates() {
        // Separate data and metadata chunks, each created at the smallest
        // size the create contract permits for a split placement.
        struct ExactFitSplit;

        impl WritePolicy for ExactFitSplit {
            fn select_chunk(
                &mut self,
                _meta: Data<'_>,
                _data: ResourceData<'_>,
                chunks: &[HailstormChunk],
            ) -> WriteChunkRef {
                let data_chunk = chunks
                    .iter()
                    .rposition(|c| c.chunk_type() == ChunkType::Data)
                    .unwrap() as u16;
                let meta_chunk = chunks
                    .iter()
                    .rposition(|c| c.chunk_type() == ChunkType::Metadata)
                    .unwrap() as u16;
                WriteChunkRef {
                    data_chunk,
                    meta_chunk,
                    ..WriteChunkRef::default()
                }
            }

            fn create_chunk(
                &mut self,
                meta: Data<'_>,
                data: ResourceData<'_>,
                base: HailstormChunk,
            ) -> HailstormChunk {
                HailstormChunk::new(
                    base.chunk_type(),
                    Persistence::Regular,
                    8,
                    meta.size().max(data.size()),
                )
            }
        }

        let alloc = SystemAllocator;
        let initial = [
            HailstormChunk::new(ChunkType::Data, Persistence::Regular, 8, 16),
            HailstormChunk::new(ChunkType::Metadata, Persistence::Regular, 8, 8),
        ];
        let blob_a = [1u8; 16];
        let blob_b = [2u8; 24];
        let data = [
            ResourceData::Inline(Data::new(&blob_a, 8)),
            ResourceData::Inline(Data::new(&blob_b, 8)),
        ];
        let metadata = [Data::new(b"meta0000", 1), Data::new(b"meta1111", 1)];
        let input = write_data(&["a", "b"], &data, &metadata, &[]);

        let result = assign_chunks(&alloc, &params(&alloc, &initial), &mut ExactFitSplit, &input);

        // The first resource fills both seeded chunks to the last byte; the
        // second overflows both and lands in one fresh exact-fit pair.
        assert_eq!(result.chunks.len(), 4);
        assert_eq!(result.refs[0].data_chunk, 0);
        assert_eq!(result.refs[0].meta_chunk, 1);
        assert_eq!(result.refs[1].data_chunk, 2);
        assert_eq!(result.refs[1].meta_chunk, 3);
        assert_eq!(result.chunks[2].chunk_type(), ChunkType::Data);
        assert_eq!(result.chunks[3].chunk_type(), ChunkType::Metadata);
        assert_eq!(result.chunks[0].size.get(), 16);
        assert_eq!(result.chunks[1].size.get(), 8);
        assert_eq!(result.chunks[2].size.get(), 24);
        assert_eq!(result.chunks[3].size.get(), 8);
        for chunk_idx in 0..result.chunks.len() {
            assert_eq!(result.chunks[chunk_idx].count_entries.get(), 1);
        }
    }

    #[test]
    fn oversize_resource_gets_exclusive_chunk() {
        let alloc = SystemAllocator;
        let data = [ResourceData::Deferred {
            size: 40 * 1024 * 1024,
            align: 8,
        }];
        let metadata = [Data::new(b"M", 1)];
        let input = write_data(&["big"], &data, &metadata, &[]);

        let result = assign_chunks(&alloc, &params(&alloc, &[]), &mut DefaultPolicy, &input);

        assert_eq!(result.chunks.len(), 1);
        assert!(result.chunks[0].size.get() >= 40 * 1024 * 1024);
        assert!(result.needs_resource_writer);
    }

    #[test]
    fn shared_metadata_is_placed_once() {
        let alloc = SystemAllocator;
        let data = [
            ResourceData::Inline(Data::new(b"X", 1)),
            ResourceData::Inline(Data::new(b"Y", 1)),
            ResourceData::Inline(Data::new(b"Z", 1)),
        ];
        let metadata = [Data::new(b"shared-meta", 1)];
        let input = write_data(&["a", "b", "c"], &data, &metadata, &[0, 0, 0]);

        let result = assign_chunks(&alloc, &params(&alloc, &[]), &mut DefaultPolicy, &input);

        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.meta_tracker[0], 0);
        // Three data placements in a mixed chunk, the shared metadata does
        // not count again.
        assert_eq!(result.chunks[0].count_entries.get(), 3);
        // 11 bytes of metadata once, plus three 1 byte blobs.
        assert_eq!(result.used[0], 14);
    }

    #[test]
    fn app_specific_chunk_keeps_its_size() {
        let alloc = SystemAllocator;
        let initial = [HailstormChunk::new(
            ChunkType::AppSpecific,
            Persistence::LoadAlways,
            8,
            100,
        )];
        let data = [ResourceData::Inline(Data::new(b"X", 1))];
        let metadata = [Data::new(b"M", 1)];
        let input = write_data(&["a"], &data, &metadata, &[]);

        let result = assign_chunks(&alloc, &params(&alloc, &initial), &mut SmallChunks(64), &input);

        // The custom chunk is not data capable; the resource forces a new
        // mixed chunk while the custom chunk keeps its requested size,
        // rounded to its alignment.
        assert_eq!(result.chunks.len(), 2);
        assert_eq!(result.chunks[0].chunk_type(), ChunkType::AppSpecific);
        assert_eq!(result.chunks[0].size.get(), 104);
        assert_eq!(result.chunks[0].count_entries.get(), 0);
        assert_eq!(result.refs[0].data_chunk, 1);
    }
}
