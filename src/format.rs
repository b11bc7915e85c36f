//! On-disk record types of the hailstorm format, version `HSC0`.
//!
//! Every record is a `#[repr(C)]` struct over unaligned little-endian
//! fields, so typed views can be taken directly at the file offsets the
//! cluster layout prescribes, on any host.
//!
//! # Chunk record
//!
//! | Type | Name             | Description |
//! | ---: | ---------------- | ----------- |
//! | u64  | offset           | Absolute offset where chunk data is stored |
//! | u64  | size             | On-disk size of the chunk data |
//! | u64  | size_origin      | Logical size after decompression/decryption, equals `size` when neither flag is set |
//! | u32  | align            | Power of two alignment for the chunk's start address in runtime memory |
//! | u8   | flags            | bits 0-1 type, bits 2-5 persistence, bit 6 encrypted, bit 7 compressed |
//! | u8   | app_custom_value | Application specific |
//! | u16  | count_entries    | Number of resource placements stored in this chunk |
//!
//! # Resource record
//!
//! | Type | Name        | Description |
//! | ---: | ----------- | ----------- |
//! | u16  | chunk       | Index of the chunk holding the resource data |
//! | u16  | meta_chunk  | Index of the chunk holding the resource metadata |
//! | u32  | offset      | Data offset, relative to the data chunk |
//! | u32  | size        | Data size |
//! | u32  | meta_offset | Metadata offset, relative to the meta chunk |
//! | u32  | meta_size   | Metadata size |
//! | u32  | path_offset | Offset into the path data blob. Patch packs store the patched resource index here instead |
//! | u32  | path_size   | Path length in bytes, unused in patch packs |

use static_assertions::assert_eq_size;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Magic value, selected once and never changing for this format. The first
/// four bytes of every cluster read `ISHS`.
pub const MAGIC: u32 = u32::from_le_bytes(*b"ISHS");

/// Identifies the variant header following the base header.
pub const HEADER_VERSION_V0: u32 = u32::from_le_bytes(*b"HSC0");

/// A base header present in any hailstorm version, ABI-stable forever.
/// Loading these 16 bytes is enough to learn how much more to load.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HailstormHeaderBase {
    pub magic: U32,
    pub header_version: U32,
    /// Byte count from offset 0 up to the end of the resource table. Does
    /// not include path data.
    pub header_size: U64,
}

/// Hailstorm header for version `HSC0`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HailstormHeader {
    pub base: HailstormHeaderBase,

    /// Absolute offset of the next concatenated cluster's base header.
    /// Equals the total cluster size when this is the last cluster.
    pub offset_next: U64,

    /// Offset at which chunk data begins, also the end of the path data
    /// region. Loading this much instead of `header_size` picks up paths.
    pub offset_data: U64,

    /// Application version that produced the pack.
    pub version: [u8; 3],

    /// Packed pack flags, see the `FLAG_*` constants.
    pub flags: u8,

    pub count_chunks: U16,
    pub count_resources: U16,

    /// Unique for base packs; expansion and patch packs carry the id of the
    /// base pack they extend.
    pub pack_id: U32,

    /// 0 for base packs, growing for each expansion or patch applied on top
    /// of the same `pack_id`.
    pub pack_order: U32,

    /// Custom values available for application specific use.
    pub app_custom_values: [U32; 4],
}

impl HailstormHeader {
    /// All chunk data is encrypted separately; decrypt before reading.
    pub const FLAG_ENCRYPTED: u8 = 1 << 0;
    /// Expansion pack with additional data for an existing base pack.
    pub const FLAG_EXPANSION: u8 = 1 << 1;
    /// Patch pack containing updated versions of existing resources.
    pub const FLAG_PATCH: u8 = 1 << 2;
    /// Pack data is pre-baked and consumable without further transformation.
    pub const FLAG_BAKED: u8 = 1 << 3;

    pub fn is_encrypted(&self) -> bool {
        self.flags & Self::FLAG_ENCRYPTED != 0
    }

    pub fn is_expansion(&self) -> bool {
        self.flags & Self::FLAG_EXPANSION != 0
    }

    pub fn is_patch(&self) -> bool {
        self.flags & Self::FLAG_PATCH != 0
    }

    pub fn is_baked(&self) -> bool {
        self.flags & Self::FLAG_BAKED != 0
    }
}

/// Locates the path data blob. A `size` of zero means no path data is
/// present, which is legal for patch packs.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HailstormPaths {
    /// Absolute offset of the path data blob.
    pub offset: U64,
    /// Byte length of the path data blob, always a multiple of 8.
    pub size: U64,
}

/// The type of data stored in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Contents undefined by the format, written by the application.
    AppSpecific = 0,
    Metadata = 1,
    Data = 2,
    Mixed = 3,
}

impl ChunkType {
    pub fn from_bits(bits: u8) -> ChunkType {
        match bits & 0b11 {
            0 => ChunkType::AppSpecific,
            1 => ChunkType::Metadata,
            2 => ChunkType::Data,
            _ => ChunkType::Mixed,
        }
    }

    pub fn holds_data(self) -> bool {
        self as u8 & 0b10 != 0
    }

    pub fn holds_metadata(self) -> bool {
        self as u8 & 0b01 != 0
    }
}

/// Preferred loading strategy for a chunk. Advisory; the format never
/// enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Persistence {
    /// One-use data that can be released soon after loading.
    Temporary = 0,
    /// On-demand loading, can be unloaded when unused.
    Regular = 1,
    /// Keeping the chunk resident reduces loading times.
    LoadIfPossible = 2,
    /// Accessed all the time, should never be unloaded.
    LoadAlways = 3,
}

impl Persistence {
    pub fn from_bits(bits: u8) -> Persistence {
        match bits & 0b1111 {
            0 => Persistence::Temporary,
            2 => Persistence::LoadIfPossible,
            3 => Persistence::LoadAlways,
            // Reserved values read as the regular strategy.
            _ => Persistence::Regular,
        }
    }
}

/// Chunk information used to optimize loading and keeping resources in
/// memory.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HailstormChunk {
    pub offset: U64,
    pub size: U64,
    pub size_origin: U64,
    pub align: U32,
    pub flags: u8,
    pub app_custom_value: u8,
    pub count_entries: U16,
}

impl HailstormChunk {
    const TYPE_MASK: u8 = 0b0000_0011;
    const PERSISTENCE_SHIFT: u8 = 2;
    const PERSISTENCE_MASK: u8 = 0b0011_1100;
    pub const FLAG_ENCRYPTED: u8 = 1 << 6;
    pub const FLAG_COMPRESSED: u8 = 1 << 7;

    pub fn new(
        chunk_type: ChunkType,
        persistence: Persistence,
        align: u32,
        size: u64,
    ) -> HailstormChunk {
        let flags =
            (chunk_type as u8 & Self::TYPE_MASK) | ((persistence as u8) << Self::PERSISTENCE_SHIFT);
        HailstormChunk {
            offset: U64::new(0),
            size: U64::new(size),
            size_origin: U64::new(0),
            align: U32::new(align),
            flags,
            app_custom_value: 0,
            count_entries: U16::new(0),
        }
    }

    pub fn chunk_type(&self) -> ChunkType {
        ChunkType::from_bits(self.flags & Self::TYPE_MASK)
    }

    pub fn persistence(&self) -> Persistence {
        Persistence::from_bits((self.flags & Self::PERSISTENCE_MASK) >> Self::PERSISTENCE_SHIFT)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & Self::FLAG_ENCRYPTED != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & Self::FLAG_COMPRESSED != 0
    }
}

/// Resource information, used to access resource related data inside the
/// chunks.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HailstormResource {
    pub chunk: U16,
    pub meta_chunk: U16,
    pub offset: U32,
    pub size: U32,
    pub meta_offset: U32,
    pub meta_size: U32,
    pub path_offset: U32,
    pub path_size: U32,
}

impl HailstormResource {
    /// In patch packs `path_offset` holds the absolute index of the patched
    /// resource across the base pack and its expansions.
    pub fn patch_resource_index(&self) -> u32 {
        self.path_offset.get()
    }
}

assert_eq_size!([u8; 16], HailstormHeaderBase);
assert_eq_size!([u8; 64], HailstormHeader);
assert_eq_size!([u8; 16], HailstormPaths);
assert_eq_size!([u8; 32], HailstormChunk);
assert_eq_size!([u8; 28], HailstormResource);

/// Header data of a cluster wrapped in a more accessible way, produced by
/// [`crate::reader::read_header`]. The chunk, resource and path views point
/// into the caller's buffer, nothing is copied.
#[derive(Debug, Clone, Copy)]
pub struct HailstormData<'a> {
    pub header: HailstormHeader,
    pub chunks: &'a [HailstormChunk],
    pub resources: &'a [HailstormResource],
    pub paths: HailstormPaths,
    /// The path data blob, or empty when the input span did not cover it.
    pub paths_data: &'a [u8],
}

impl<'a> HailstormData<'a> {
    /// Resolves a resource's path from the loaded path data. Returns `None`
    /// for patch packs, when path data was not loaded, or when the entry is
    /// out of bounds.
    pub fn resource_path(&self, index: usize) -> Option<&'a str> {
        if self.header.is_patch() {
            return None;
        }
        let resource = self.resources.get(index)?;
        let start = resource.path_offset.get() as usize;
        let end = start.checked_add(resource.path_size.get() as usize)?;
        let bytes = self.paths_data.get(start..end)?;
        std::str::from_utf8(bytes).ok()
    }
}

impl Default for HailstormData<'_> {
    fn default() -> Self {
        HailstormData {
            header: HailstormHeader::new_zeroed(),
            chunks: &[],
            resources: &[],
            paths: HailstormPaths::new_zeroed(),
            paths_data: &[],
        }
    }
}

#[cfg(test)]
mod test_format {
    use super::*;

    #[test]
    fn magic_is_readable_in_file_order() {
        assert_eq!(MAGIC.to_le_bytes(), *b"ISHS");
        assert_eq!(HEADER_VERSION_V0.to_le_bytes(), *b"HSC0");
    }

    #[test]
    fn chunk_flag_packing() {
        let chunk = HailstormChunk::new(ChunkType::Mixed, Persistence::LoadAlways, 8, 1024);
        assert_eq!(chunk.chunk_type(), ChunkType::Mixed);
        assert_eq!(chunk.persistence(), Persistence::LoadAlways);
        assert!(!chunk.is_encrypted());
        assert!(!chunk.is_compressed());
        assert_eq!(chunk.flags, 0b0000_1111);

        let chunk = HailstormChunk::new(ChunkType::Metadata, Persistence::Temporary, 8, 0);
        assert_eq!(chunk.chunk_type(), ChunkType::Metadata);
        assert_eq!(chunk.persistence(), Persistence::Temporary);
    }

    #[test]
    fn chunk_type_capabilities() {
        assert!(!ChunkType::AppSpecific.holds_data());
        assert!(!ChunkType::AppSpecific.holds_metadata());
        assert!(ChunkType::Metadata.holds_metadata());
        assert!(!ChunkType::Metadata.holds_data());
        assert!(ChunkType::Data.holds_data());
        assert!(!ChunkType::Data.holds_metadata());
        assert!(ChunkType::Mixed.holds_data());
        assert!(ChunkType::Mixed.holds_metadata());
    }

    #[test]
    fn header_flags() {
        let mut header = HailstormHeader::new_zeroed();
        assert!(!header.is_patch());

        header.flags = HailstormHeader::FLAG_EXPANSION | HailstormHeader::FLAG_BAKED;
        assert!(header.is_expansion());
        assert!(header.is_baked());
        assert!(!header.is_encrypted());
        assert!(!header.is_patch());
    }

    #[test]
    fn records_have_no_padding() {
        // IntoBytes would reject padded layouts at compile time; pin the
        // exact field order on top of that.
        let chunk = HailstormChunk {
            offset: 0x01.into(),
            size: 0x02.into(),
            size_origin: 0x03.into(),
            align: 0x04.into(),
            flags: 0x05,
            app_custom_value: 0x06,
            count_entries: 0x07.into(),
        };
        let bytes = chunk.as_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[8], 0x02);
        assert_eq!(bytes[16], 0x03);
        assert_eq!(bytes[24], 0x04);
        assert_eq!(bytes[28], 0x05);
        assert_eq!(bytes[29], 0x06);
        assert_eq!(bytes[30], 0x07);
    }
}
