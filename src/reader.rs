//! Header reader. Validates a loaded header span and publishes typed views
//! over the caller's buffer, without copying any record data.

use zerocopy::FromBytes;

use crate::format::{
    HailstormChunk, HailstormData, HailstormHeader, HailstormHeaderBase, HailstormPaths,
    HailstormResource, HEADER_VERSION_V0, MAGIC,
};
use crate::mem::{align_up, Data};
use crate::Error;

const GIB: u64 = 1024 * 1024 * 1024;

/// Reads a hailstorm cluster header from `data`, which must cover at least
/// the whole header region (`header_size` bytes). On success `out` gives
/// access to the header, the chunk and resource tables, and the path blob
/// when the span extends far enough to contain it.
///
/// A cluster without chunks still publishes its (empty) views but reports
/// [`Error::EmptyPack`].
pub fn read_header<'a>(data: Data<'a>, out: &mut HailstormData<'a>) -> Result<(), Error> {
    let bytes = data.bytes;
    if bytes.len() < std::mem::size_of::<HailstormHeaderBase>() {
        return Err(Error::IncompleteHeaderData);
    }

    let base = HailstormHeaderBase::ref_from_bytes(&bytes[..16])
        .map_err(|_| Error::InvalidPackData)?;
    if base.magic.get() != MAGIC || base.header_size.get() >= GIB {
        return Err(Error::InvalidPackData);
    }
    if base.header_version.get() != HEADER_VERSION_V0 {
        return Err(Error::IncompatiblePackData);
    }

    let header_size = base.header_size.get() as usize;
    if bytes.len() < header_size {
        return Err(Error::IncompleteHeaderData);
    }

    let header_end = std::mem::size_of::<HailstormHeader>();
    let paths_end = header_end + std::mem::size_of::<HailstormPaths>();
    if header_size < paths_end {
        return Err(Error::InvalidPackData);
    }

    let header = HailstormHeader::ref_from_bytes(&bytes[..header_end])
        .map_err(|_| Error::InvalidPackData)?;
    let paths = HailstormPaths::ref_from_bytes(&bytes[header_end..paths_end])
        .map_err(|_| Error::InvalidPackData)?;

    // Recompute the header layout from the embedded counts; a mismatching
    // header_size means unreadable tables. Every view below is in bounds
    // by construction afterwards.
    let count_chunks = header.count_chunks.get() as usize;
    let count_resources = header.count_resources.get() as usize;
    let chunk_record = std::mem::size_of::<HailstormChunk>();
    let resource_record = std::mem::size_of::<HailstormResource>();
    let resources_offset = align_up((paths_end + chunk_record * count_chunks) as u64, 4) as usize;
    if header_size != resources_offset + resource_record * count_resources {
        return Err(Error::InvalidPackData);
    }

    let chunks = <[HailstormChunk]>::ref_from_bytes(
        &bytes[paths_end..paths_end + chunk_record * count_chunks],
    )
    .map_err(|_| Error::InvalidPackData)?;
    let resources = <[HailstormResource]>::ref_from_bytes(
        &bytes[resources_offset..resources_offset + resource_record * count_resources],
    )
    .map_err(|_| Error::InvalidPackData)?;

    out.header = *header;
    out.paths = *paths;
    out.chunks = chunks;
    out.resources = resources;
    out.paths_data = &[];

    if count_chunks == 0 {
        return Err(Error::EmptyPack);
    }

    // Check with no overflow that the pack data offsets are addressable.
    let last_chunk = &chunks[count_chunks - 1];
    if (usize::MAX as u64 - last_chunk.offset.get()) < last_chunk.size.get() {
        return Err(Error::LargePackNotSupported);
    }

    // Paths are only available when the caller loaded far enough; a short
    // span is legal and simply publishes no path data.
    let paths_offset = paths.offset.get();
    let paths_extent = paths_offset.checked_add(paths.size.get());
    match paths_extent {
        Some(end) if end <= bytes.len() as u64 => {
            out.paths_data = &bytes[paths_offset as usize..end as usize];
        }
        Some(_) => {}
        None => return Err(Error::InvalidPackData),
    }

    Ok(())
}
