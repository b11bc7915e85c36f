//! In-place path table rewriting. Mounting a pack under a directory prefix
//! only needs the packed path blob to be rewritten once, shifting every
//! entry right and prepending the prefix, instead of rebuilding the table.

use crate::format::{HailstormPaths, HailstormResource};

/// Returns the buffer size needed to store the path table with `prefix`
/// prepended to every one of the `resource_count` entries.
pub fn prefixed_resource_paths_size(
    paths: &HailstormPaths,
    resource_count: u32,
    prefix: &str,
) -> u64 {
    paths.size.get() + resource_count as u64 * prefix.len() as u64
}

/// Prepends `prefix` to every stored path in place and updates every
/// resource's `path_offset` and `path_size`.
///
/// `buffer` must start with the packed path table (`paths.size` bytes) and
/// have room for at least [`prefixed_resource_paths_size`] bytes. The
/// operation works right to left so overlapping moves never lose bytes, and
/// it must always be handed the entire resource list of the pack.
///
/// Returns `false` without completing when the buffer is too small or when
/// the rewrite cursor exhausts the buffer before every resource was
/// consumed, which indicates a path table inconsistent with `resources`.
pub fn prefix_resource_paths(
    paths: &HailstormPaths,
    resources: &mut [HailstormResource],
    buffer: &mut [u8],
    prefix: &str,
) -> bool {
    let required = prefixed_resource_paths_size(paths, resources.len() as u32, prefix);
    if required > buffer.len() as u64 {
        return false;
    }

    let paths_size = paths.size.get() as usize;
    let prefix_len = prefix.len();
    let extending = prefix_len * resources.len();

    // Find the end of the last stored path; the writer guarantees the blob
    // tail is NUL filled.
    let mut end = paths_size;
    while end > 0 && buffer[end - 1] == 0 {
        end -= 1;
    }

    // `cursor` is where the trailing NUL of the next rewritten entry goes.
    let mut cursor = end + extending;
    let mut remaining = resources.len();

    for resource in resources.iter_mut().rev() {
        let path_size = resource.path_size.get() as usize;
        let path_offset = resource.path_offset.get() as usize;
        let entry = prefix_len + path_size;

        if cursor >= buffer.len() || entry > cursor || path_offset + path_size > paths_size {
            return false;
        }

        buffer[cursor] = 0;
        let path_start = cursor - path_size;
        buffer.copy_within(path_offset..path_offset + path_size, path_start);
        let entry_start = path_start - prefix_len;
        buffer[entry_start..path_start].copy_from_slice(prefix.as_bytes());

        resource.path_offset.set(entry_start as u32);
        resource.path_size.set(entry as u32);

        remaining -= 1;
        if entry_start == 0 {
            cursor = 0;
            break;
        }
        cursor = entry_start - 1;
    }

    // The cursor has to land exactly at the buffer start with no resources
    // left over.
    remaining == 0 && cursor == 0
}
