//! Hailstorm resource-package container format
//!
//! A hailstorm *cluster* is a single contiguous byte sequence that aggregates
//! many named application resources together with their metadata. The header
//! region is self describing: loading only `header_size` bytes is enough to
//! enumerate every chunk and resource, after which a reader can fetch only
//! the chunks it actually needs. Unless otherwise noted everything is stored
//! in Little Endian format and offsets are absolute from the cluster start.
//!
//! # Top Level
//!
//! | Type          | Name      | Description |
//! | ------------: | --------- | ----------- |
//! | [u8; 64]      | header    | [`format::HailstormHeader`], starts with the 16 byte base header |
//! | [u8; 16]      | paths     | [`format::HailstormPaths`], locates the path data blob |
//! | [u8; 32 * N]  | chunks    | One [`format::HailstormChunk`] per chunk |
//! | [u8; 28 * N]  | resources | One [`format::HailstormResource`] per resource |
//! | [u8; N]       | path data | NUL separated path strings, zero padded to an 8 byte tail |
//! | [u8; N]       | data      | Chunk data, each chunk start 8 byte aligned from the previous end |
//!
//! `header_size` covers everything up to the end of the resource table and
//! excludes path data. `offset_data` marks the start of chunk data which is
//! also the end of the path data blob. Multiple clusters may be concatenated
//! in one file; `offset_next` then holds the absolute offset of the next
//! cluster's base header and equals the total cluster size for the last one.
//!
//! # Writing
//!
//! [`writer::write_cluster`] assembles a cluster in memory from the resource
//! descriptions in a [`writer::WriteData`]. Chunk placement is driven by a
//! caller supplied [`writer::WritePolicy`]; the default policy packs data and
//! metadata into mixed 32 MiB chunks and grows the cluster through the
//! overflow driven chunk creation dance. [`writer::write_cluster_async`]
//! runs the same layout and emit sequence but streams every write as an
//! offset addressed callback through a [`writer::ClusterWriter`], for hosts
//! that want to hand the bytes to their own (possibly asynchronous) I/O.
//!
//! # Reading
//!
//! [`reader::read_header`] validates the base header and publishes typed
//! views over the caller's buffer without copying. Path tables of mounted
//! packs can be rewritten in place with [`paths::prefix_resource_paths`].

pub mod array;
pub mod format;
pub mod mem;
pub mod paths;
pub mod reader;
pub mod writer;

mod assign;
mod layout;

use thiserror::Error;

pub use format::HailstormData;
pub use paths::{prefix_resource_paths, prefixed_resource_paths_size};
pub use reader::read_header;
pub use writer::{write_cluster, write_cluster_async};

/// Errors surfaced by the reader and the cluster builder entry points.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The given arguments are not valid for the function trying to execute.
    #[error("invalid argument")]
    InvalidArgument,

    /// Pack data was not recognized, invalid magic value or unreadable fields.
    #[error("pack data was not recognized")]
    InvalidPackData,

    /// Pack header data is not complete and could not be fully read.
    #[error("pack header data is incomplete")]
    IncompleteHeaderData,

    /// The header version is known but not supported by this library build.
    #[error("pack data is not compatible with this library build")]
    IncompatiblePackData,

    /// On 32bit architectures it might not be possible to address large packs.
    #[error("pack is too large to be addressed on this architecture")]
    LargePackNotSupported,

    /// There are no chunks stored in the pack. It is allowed to have chunks
    /// without resources, so a pack with chunks but no resources is NOT
    /// considered empty.
    #[error("no chunks stored in the pack")]
    EmptyPack,
}
