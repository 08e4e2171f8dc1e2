#![forbid(unsafe_code)]
//! Data stream engine.
//!
//! Projects a logical byte range of a `FILE_DATA` attribute onto physical
//! extents. Streams are DIRECT (bytes inline in the attribute), INDIRECT
//! (up to four inline extents), or INDIRECT_2 (up to eight blocks each
//! holding a packed extent list). Resizing moves between these modes;
//! a grow that runs out of space frees everything it allocated.

use esfs_alloc::{allocate_extent, free_extent};
use esfs_block::BlockIo;
use esfs_error::{EsfsError, Result};
use esfs_ondisk::{DataPayload, FileDataAttr, Superblock};
use esfs_types::{
    blocks_needed_to_store, u64_to_usize, GlobalExtent, DIRECT_BYTES, GLOBAL_EXTENT_SIZE,
    INDIRECT_2_BLOCKS, INDIRECT_EXTENTS,
};
use tracing::{debug, trace, warn};

fn corruption(block: u64, detail: impl Into<String>) -> EsfsError {
    EsfsError::Corruption {
        block,
        detail: detail.into(),
    }
}

fn extents_per_block(block_size: u64) -> u64 {
    block_size / GLOBAL_EXTENT_SIZE as u64
}

/// Largest number of extents an INDIRECT_2 stream can carry.
fn max_extent_count(block_size: u64) -> u64 {
    INDIRECT_2_BLOCKS as u64 * extents_per_block(block_size)
}

// ── Extent list materialisation ─────────────────────────────────────────────

/// Concatenate the stream's extents into one in-memory list.
///
/// INDIRECT_2 reads every referenced extent-list block; slots that are
/// zero leave holes of empty extents.
fn materialize_extent_list(
    io: &BlockIo,
    sb: &Superblock,
    data: &FileDataAttr,
) -> Result<Vec<GlobalExtent>> {
    let count = usize::from(data.extent_count);
    match &data.payload {
        DataPayload::Direct(_) => Err(EsfsError::IncorrectFileAccess),
        DataPayload::Indirect(extents) => Ok(extents[..count.min(INDIRECT_EXTENTS)].to_vec()),
        DataPayload::Indirect2(blocks) => {
            let per_block = extents_per_block(sb.block_size);
            let list_blocks =
                blocks_needed_to_store(count as u64 * GLOBAL_EXTENT_SIZE as u64, sb.block_size);
            let mut list =
                vec![GlobalExtent::ZERO; u64_to_usize(list_blocks * per_block, "extent_list")?];

            let mut raw = vec![0_u8; u64_to_usize(sb.block_size, "block_size")?];
            for (index, &block) in blocks.iter().enumerate().take(u64_to_usize(
                list_blocks.min(INDIRECT_2_BLOCKS as u64),
                "extent_list_blocks",
            )?) {
                if block == 0 {
                    continue;
                }
                io.read_blocks(block, &mut raw)?;
                let base = index * u64_to_usize(per_block, "extents_per_block")?;
                for slot in 0..u64_to_usize(per_block, "extents_per_block")? {
                    list[base + slot] =
                        GlobalExtent::decode(&raw, slot * GLOBAL_EXTENT_SIZE)?;
                }
            }
            list.truncate(count);
            Ok(list)
        }
    }
}

/// Serialize a slice of the in-memory extent list into one block image.
fn encode_extent_list_block(
    list: &[GlobalExtent],
    list_block: u64,
    block_size: u64,
) -> Result<Vec<u8>> {
    let per_block = u64_to_usize(extents_per_block(block_size), "extents_per_block")?;
    let start = u64_to_usize(list_block, "list_block")? * per_block;
    let end = list.len().min(start + per_block);
    let mut raw = vec![0_u8; u64_to_usize(block_size, "block_size")?];
    for (slot, extent) in list[start..end].iter().enumerate() {
        raw[slot * GLOBAL_EXTENT_SIZE..(slot + 1) * GLOBAL_EXTENT_SIZE]
            .copy_from_slice(&extent.encode());
    }
    Ok(raw)
}

/// Resolve a stream-relative block index against the extent list.
fn lookup_stream_block(extents: &[GlobalExtent], block_in_stream: u64) -> Option<u64> {
    let mut walked = 0_u64;
    for extent in extents {
        if block_in_stream < walked + extent.count {
            return Some(extent.offset + (block_in_stream - walked));
        }
        walked += extent.count;
    }
    None
}

/// The global block backing byte `offset` of the stream.
pub fn get_block_from_stream(
    io: &BlockIo,
    sb: &Superblock,
    data: &FileDataAttr,
    offset: u64,
) -> Result<u64> {
    let extents = materialize_extent_list(io, sb, data)?;
    let block_in_stream = (offset & !(sb.block_size - 1)) / sb.block_size;
    lookup_stream_block(&extents, block_in_stream)
        .ok_or_else(|| corruption(0, format!("stream has no block for offset {offset}")))
}

// ── Stream access ───────────────────────────────────────────────────────────

fn check_stream_bounds(data: &FileDataAttr, offset: u64, len: usize) -> Result<()> {
    let len = u64::try_from(len).map_err(|_| EsfsError::IncorrectFileAccess)?;
    let end = offset.checked_add(len).ok_or(EsfsError::IncorrectFileAccess)?;
    if end > data.size {
        return Err(EsfsError::IncorrectFileAccess);
    }
    Ok(())
}

/// Walk the stream in runs of contiguous global blocks, bounded by the
/// device transfer limit, and call `op(first_block, offset_into_block,
/// buffer_range)` once per run. Returns the first block of the final run.
fn access_stream_blocks(
    io: &BlockIo,
    sb: &Superblock,
    data: &FileDataAttr,
    offset: u64,
    len: usize,
    mut op: impl FnMut(u64, u64, std::ops::Range<usize>) -> Result<()>,
) -> Result<Option<u64>> {
    if len == 0 {
        return Ok(None);
    }

    let block_size = sb.block_size;
    let offset_aligned = offset & !(block_size - 1);
    let mut offset_into_block = offset - offset_aligned;
    let mut blocks_remaining = blocks_needed_to_store(len as u64 + offset_into_block, block_size);
    let mut block_in_stream = offset_aligned / block_size;

    let extents = materialize_extent_list(io, sb, data)?;
    let max_run = io.max_blocks_per_access();

    let mut pos = 0_usize;
    let mut remaining = len;
    let mut last_block = None;

    while blocks_remaining > 0 {
        let first = lookup_stream_block(&extents, block_in_stream).ok_or_else(|| {
            corruption(0, format!("stream block {block_in_stream} is unmapped"))
        })?;
        let mut run = 1_u64;
        blocks_remaining -= 1;
        block_in_stream += 1;

        while blocks_remaining > 0 && run < max_run {
            match lookup_stream_block(&extents, block_in_stream) {
                Some(next) if next == first + run => {
                    run += 1;
                    blocks_remaining -= 1;
                    block_in_stream += 1;
                }
                _ => break,
            }
        }

        let run_capacity = u64_to_usize(run * block_size - offset_into_block, "run_bytes")?;
        let run_bytes = run_capacity.min(remaining);
        op(first, offset_into_block, pos..pos + run_bytes)?;

        last_block = Some(first);
        pos += run_bytes;
        remaining -= run_bytes;
        offset_into_block = 0;
    }

    Ok(last_block)
}

/// Read `buf.len()` bytes starting at `offset`.
///
/// Returns the first global block of the final run touched, or `None`
/// when the read was served from the inline DIRECT payload.
pub fn read_stream(
    io: &BlockIo,
    sb: &Superblock,
    data: &FileDataAttr,
    offset: u64,
    buf: &mut [u8],
) -> Result<Option<u64>> {
    check_stream_bounds(data, offset, buf.len())?;
    if buf.is_empty() {
        return Ok(None);
    }

    if let DataPayload::Direct(bytes) = &data.payload {
        let start = u64_to_usize(offset, "offset")?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        return Ok(None);
    }

    access_stream_blocks(io, sb, data, offset, buf.len(), |block, into, range| {
        io.read_at(block, into, &mut buf[range])
    })
}

/// Write `buf` at `offset`. The stream is never grown here; callers
/// resize first.
pub fn write_stream(
    io: &BlockIo,
    sb: &Superblock,
    data: &mut FileDataAttr,
    offset: u64,
    buf: &[u8],
) -> Result<Option<u64>> {
    check_stream_bounds(data, offset, buf.len())?;
    if buf.is_empty() {
        return Ok(None);
    }

    if let DataPayload::Direct(bytes) = &mut data.payload {
        let start = u64_to_usize(offset, "offset")?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        return Ok(None);
    }

    access_stream_blocks(io, sb, data, offset, buf.len(), |block, into, range| {
        io.write_at(block, into, &buf[range])
    })
}

// ── Resize ──────────────────────────────────────────────────────────────────

/// Grow or shrink the stream to `new_size` bytes.
///
/// Growing allocates near `container_block`'s group and zeroes new blocks
/// when `clear_new_blocks` is set; on failure every extent allocated by
/// this call is freed and the attribute is left unchanged. The `size`
/// field is only updated once all extent-list persistence has completed.
pub fn resize_data_stream(
    io: &BlockIo,
    sb: &mut Superblock,
    gdt: &mut [esfs_ondisk::GroupDescriptor],
    data: &mut FileDataAttr,
    new_size: u64,
    clear_new_blocks: bool,
    container_block: u64,
) -> Result<()> {
    if new_size > data.size {
        grow(io, sb, gdt, data, new_size, clear_new_blocks, container_block)
    } else if new_size < data.size {
        shrink(io, sb, gdt, data, new_size)
    } else {
        Ok(())
    }
}

fn grow(
    io: &BlockIo,
    sb: &mut Superblock,
    gdt: &mut [esfs_ondisk::GroupDescriptor],
    data: &mut FileDataAttr,
    new_size: u64,
    clear_new_blocks: bool,
    container_block: u64,
) -> Result<()> {
    let old_size = data.size;

    if let DataPayload::Direct(bytes) = &mut data.payload {
        if new_size <= DIRECT_BYTES as u64 {
            // The stream still fits into the attribute.
            if clear_new_blocks {
                let old = u64_to_usize(old_size, "size")?;
                let new = u64_to_usize(new_size, "size")?;
                bytes[old..new].fill(0);
            }
            data.size = new_size;
            return Ok(());
        }
    }

    // Work on a scratch copy so a failed grow leaves the attribute as it
    // was; the extents allocated along the way are handed back.
    let mut scratch = data.clone();
    let mut allocated: Vec<GlobalExtent> = Vec::new();
    match grow_indirect(
        io,
        sb,
        gdt,
        &mut scratch,
        new_size,
        clear_new_blocks,
        container_block,
        &mut allocated,
    ) {
        Ok(()) => {
            *data = scratch;
            Ok(())
        }
        Err(error) => {
            for extent in allocated {
                if let Err(free_error) = free_extent(io, sb, gdt, extent) {
                    warn!(
                        target: "esfs::stream",
                        offset = extent.offset,
                        count = extent.count,
                        %free_error,
                        "failed to release extent after aborted grow"
                    );
                }
            }
            Err(error)
        }
    }
}

/// The spilled extent list of a growing INDIRECT_2 stream, plus the first
/// list block this grow has touched (earlier blocks are already on disk).
struct SpilledList {
    list: Vec<GlobalExtent>,
    first_modified: u64,
}

#[allow(clippy::too_many_arguments)]
fn grow_indirect(
    io: &BlockIo,
    sb: &mut Superblock,
    gdt: &mut [esfs_ondisk::GroupDescriptor],
    data: &mut FileDataAttr,
    new_size: u64,
    clear_new_blocks: bool,
    container_block: u64,
    allocated: &mut Vec<GlobalExtent>,
) -> Result<()> {
    let block_size = sb.block_size;
    let old_size = data.size;
    let mut old_blocks = blocks_needed_to_store(old_size, block_size);

    // Promote DIRECT: stash the inline bytes and start from no extents.
    let mut stash: Option<[u8; DIRECT_BYTES]> = None;
    if let DataPayload::Direct(bytes) = &data.payload {
        stash = Some(*bytes);
        data.payload = DataPayload::Indirect([GlobalExtent::ZERO; INDIRECT_EXTENTS]);
        data.extent_count = 0;
        old_blocks = 0;
    }

    let new_blocks = blocks_needed_to_store(new_size, block_size);
    let mut increase = new_blocks.saturating_sub(old_blocks);
    let max_extents = max_extent_count(block_size);
    let local_group = container_block / u64::from(sb.blocks_per_group);
    let mut spilled: Option<SpilledList> = None;

    while increase > 0 {
        let extent = allocate_extent(io, sb, gdt, local_group, increase)?;
        allocated.push(extent);
        if clear_new_blocks {
            io.write_zero_blocks(extent.offset, extent.count)?;
        }
        increase -= extent.count;

        if let Some(state) = &mut spilled {
            append_spilled(state, &mut data.extent_count, extent, max_extents)?;
            continue;
        }

        match data.indirection() {
            esfs_ondisk::Indirection::Indirect => {
                let count = usize::from(data.extent_count);
                if count < INDIRECT_EXTENTS {
                    if let DataPayload::Indirect(extents) = &mut data.payload {
                        extents[count] = extent;
                    }
                    data.extent_count += 1;
                } else {
                    // Migrate to INDIRECT_2: the four inline extents move
                    // into an in-memory list and the union becomes block
                    // pointers.
                    let mut list = vec![
                        GlobalExtent::ZERO;
                        u64_to_usize(max_extents, "extent_list")?
                    ];
                    if let DataPayload::Indirect(extents) = &data.payload {
                        list[..INDIRECT_EXTENTS].copy_from_slice(extents);
                    }
                    list[INDIRECT_EXTENTS] = extent;
                    data.payload = DataPayload::Indirect2([0; INDIRECT_2_BLOCKS]);
                    data.extent_count = INDIRECT_EXTENTS as u16 + 1;
                    spilled = Some(SpilledList {
                        list,
                        first_modified: 0,
                    });
                    debug!(
                        target: "esfs::stream",
                        size = new_size,
                        "promoted stream to two-level indirection"
                    );
                }
            }
            esfs_ondisk::Indirection::Indirect2 => {
                // First append of this grow: load the partially filled
                // tail block of the on-disk list.
                let first_modified = blocks_needed_to_store(
                    u64::from(data.extent_count) * GLOBAL_EXTENT_SIZE as u64,
                    block_size,
                )
                .saturating_sub(1);
                let mut list = vec![
                    GlobalExtent::ZERO;
                    u64_to_usize(max_extents, "extent_list")?
                ];
                let tail_block = match &data.payload {
                    DataPayload::Indirect2(blocks) => {
                        blocks[u64_to_usize(first_modified, "list_block")?]
                    }
                    _ => 0,
                };
                if tail_block != 0 {
                    let mut raw = vec![0_u8; u64_to_usize(block_size, "block_size")?];
                    io.read_blocks(tail_block, &mut raw)?;
                    let per_block = extents_per_block(block_size);
                    let base = u64_to_usize(first_modified * per_block, "extent_list")?;
                    for slot in 0..u64_to_usize(per_block, "extents_per_block")? {
                        list[base + slot] =
                            GlobalExtent::decode(&raw, slot * GLOBAL_EXTENT_SIZE)?;
                    }
                }
                let mut state = SpilledList {
                    list,
                    first_modified,
                };
                append_spilled(&mut state, &mut data.extent_count, extent, max_extents)?;
                spilled = Some(state);
            }
            esfs_ondisk::Indirection::Direct => {
                return Err(corruption(container_block, "grow left a direct payload"))
            }
        }
    }

    // Persist the spilled list: every block from the first modified one
    // through the end of the list, allocating pointer blocks as needed.
    if let Some(state) = &spilled {
        let needed = blocks_needed_to_store(
            u64::from(data.extent_count) * GLOBAL_EXTENT_SIZE as u64,
            block_size,
        );
        for list_block in state.first_modified..needed {
            let slot_index = u64_to_usize(list_block, "list_block")?;
            let slot = match &data.payload {
                DataPayload::Indirect2(blocks) => blocks[slot_index],
                _ => return Err(corruption(container_block, "extent list lost its pointers")),
            };
            let target = if slot == 0 {
                let pointer = allocate_extent(io, sb, gdt, local_group, 1)?;
                allocated.push(pointer);
                if let DataPayload::Indirect2(blocks) = &mut data.payload {
                    blocks[slot_index] = pointer.offset;
                }
                pointer.offset
            } else {
                slot
            };
            let raw = encode_extent_list_block(&state.list, list_block, block_size)?;
            io.write_blocks(target, &raw)?;
        }
    }

    data.size = new_size;

    // A promoted stream rewrites its stashed bytes through the new extents.
    if let Some(bytes) = stash {
        if old_size > 0 {
            write_stream(io, sb, data, 0, &bytes[..u64_to_usize(old_size, "size")?])?;
        }
    }

    trace!(
        target: "esfs::stream",
        old_size,
        new_size,
        extents = data.extent_count,
        "grew stream"
    );
    Ok(())
}

fn append_spilled(
    state: &mut SpilledList,
    extent_count: &mut u16,
    extent: GlobalExtent,
    max_extents: u64,
) -> Result<()> {
    if u64::from(*extent_count) >= max_extents {
        // The stream cannot hold any more extents.
        return Err(EsfsError::NoSpace);
    }
    state.list[usize::from(*extent_count)] = extent;
    *extent_count += 1;
    Ok(())
}

fn shrink(
    io: &BlockIo,
    sb: &mut Superblock,
    gdt: &mut [esfs_ondisk::GroupDescriptor],
    data: &mut FileDataAttr,
    new_size: u64,
) -> Result<()> {
    // The direct union is oversized; shrinking never moves bytes.
    if matches!(data.payload, DataPayload::Direct(_)) {
        data.size = new_size;
        return Ok(());
    }

    let block_size = sb.block_size;
    let old_size = data.size;
    let to_direct = new_size <= DIRECT_BYTES as u64;

    // Read the surviving prefix before the extent list changes.
    let mut stash = [0_u8; DIRECT_BYTES];
    if to_direct && new_size > 0 {
        read_stream(io, sb, data, 0, &mut stash[..u64_to_usize(new_size, "size")?])?;
    }

    let old_blocks = blocks_needed_to_store(old_size, block_size);
    let new_blocks = if to_direct {
        0
    } else {
        blocks_needed_to_store(new_size, block_size)
    };

    if old_blocks == new_blocks {
        data.size = new_size;
        return Ok(());
    }

    let was_indirect2 = matches!(data.payload, DataPayload::Indirect2(_));
    let mut list = materialize_extent_list(io, sb, data)?;

    // Walk to the first extent that is not needed in full.
    let mut kept_blocks = 0_u64;
    let mut kept = 0_usize;
    while kept < list.len() && kept_blocks + list[kept].count <= new_blocks {
        kept_blocks += list[kept].count;
        kept += 1;
    }

    // Free the tail of the straddling extent, then the rest outright.
    if kept < list.len() && new_blocks != kept_blocks {
        let keep = new_blocks - kept_blocks;
        free_extent(
            io,
            sb,
            gdt,
            GlobalExtent {
                offset: list[kept].offset + keep,
                count: list[kept].count - keep,
            },
        )?;
        list[kept].count = keep;
        kept += 1;
    }
    let tail: Vec<GlobalExtent> = list.split_off(kept);
    for extent in tail {
        free_extent(io, sb, gdt, extent)?;
    }
    data.extent_count = u16::try_from(list.len())
        .map_err(|_| corruption(0, "shrunk extent count overflows u16"))?;

    if list.len() <= INDIRECT_EXTENTS {
        // Demote to INDIRECT; a former INDIRECT_2 stream gives back every
        // extent-list block.
        if was_indirect2 {
            if let DataPayload::Indirect2(blocks) = &data.payload {
                let pointers = *blocks;
                for pointer in pointers {
                    if pointer != 0 {
                        free_extent(
                            io,
                            sb,
                            gdt,
                            GlobalExtent {
                                offset: pointer,
                                count: 1,
                            },
                        )?;
                    }
                }
            }
        }
        let mut extents = [GlobalExtent::ZERO; INDIRECT_EXTENTS];
        extents[..list.len()].copy_from_slice(&list);
        data.payload = DataPayload::Indirect(extents);
    } else {
        // Still INDIRECT_2: drop the pointer blocks past the shortened
        // list and re-persist the last one still in use.
        let needed = blocks_needed_to_store(
            list.len() as u64 * GLOBAL_EXTENT_SIZE as u64,
            block_size,
        );
        let DataPayload::Indirect2(blocks_ref) = &data.payload else {
            return Err(corruption(0, "multi-extent stream lost its pointer blocks"));
        };
        let mut blocks = *blocks_ref;
        for slot in u64_to_usize(needed, "list_block")?..INDIRECT_2_BLOCKS {
            if blocks[slot] != 0 {
                free_extent(
                    io,
                    sb,
                    gdt,
                    GlobalExtent {
                        offset: blocks[slot],
                        count: 1,
                    },
                )?;
                blocks[slot] = 0;
            }
        }
        let raw = encode_extent_list_block(&list, needed - 1, block_size)?;
        io.write_blocks(blocks[u64_to_usize(needed - 1, "list_block")?], &raw)?;
        data.payload = DataPayload::Indirect2(blocks);
    }

    if to_direct {
        data.payload = DataPayload::Direct(stash);
        data.extent_count = 0;
    }

    data.size = new_size;
    trace!(
        target: "esfs::stream",
        old_size,
        new_size,
        extents = data.extent_count,
        "shrank stream"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use esfs_block::MemoryDevice;
    use esfs_ondisk::GroupDescriptor;
    use esfs_types::{BlockSize, LocalExtent, UniqueIdentifier, MAX_VOLUME_NAME_LENGTH};
    use std::sync::Arc;

    const BLOCK_SIZE: u64 = 512;
    const BLOCKS_PER_GROUP: u16 = 64;
    const GROUP_COUNT: u64 = 4;
    const BLOCK_COUNT: u64 = 250;
    const CONTAINER_BLOCK: u64 = 1;

    struct Fixture {
        io: BlockIo,
        sb: Superblock,
        gdt: Vec<GroupDescriptor>,
    }

    fn fixture() -> Fixture {
        let dev = Arc::new(MemoryDevice::new((BLOCK_COUNT * BLOCK_SIZE) as usize + 8192));
        let io = BlockIo::new(dev, BlockSize::new(BLOCK_SIZE).unwrap()).unwrap();

        let sb = Superblock {
            volume_name: [0; MAX_VOLUME_NAME_LENGTH],
            required_read_version: 2,
            required_write_version: 2,
            mounted: 0,
            block_size: BLOCK_SIZE,
            block_count: BLOCK_COUNT,
            blocks_used: 2,
            blocks_per_group: BLOCKS_PER_GROUP,
            group_count: GROUP_COUNT,
            blocks_per_group_extent_table: 1,
            gdt: LocalExtent { offset: 0, count: 1 },
            root_directory_file_entry: LocalExtent { offset: 1, count: 1 },
            identifier: UniqueIdentifier::ZERO,
            os_installation: UniqueIdentifier::ZERO,
        };

        let mut gdt = vec![GroupDescriptor::default(); GROUP_COUNT as usize];
        gdt[0] = GroupDescriptor {
            extent_table: 1,
            extent_count: 1,
            blocks_used: 2,
        };
        // Seed group 0's extent table directly.
        let mut raw = vec![0_u8; BLOCK_SIZE as usize];
        raw[0..4].copy_from_slice(&LocalExtent { offset: 2, count: 62 }.encode());
        io.write_blocks(1, &raw).unwrap();

        Fixture { io, sb, gdt }
    }

    fn resize(fx: &mut Fixture, data: &mut FileDataAttr, new_size: u64, clear: bool) -> Result<()> {
        resize_data_stream(
            &fx.io,
            &mut fx.sb,
            &mut fx.gdt,
            data,
            new_size,
            clear,
            CONTAINER_BLOCK,
        )
    }

    /// Grow `data` by one block, then allocate a blocker block so the next
    /// grow cannot be contiguous.
    fn grow_one_fragmented_block(fx: &mut Fixture, data: &mut FileDataAttr) {
        let size = data.size;
        resize(fx, data, size + BLOCK_SIZE, true).unwrap();
        allocate_extent(&fx.io, &mut fx.sb, &mut fx.gdt, 0, 1).unwrap();
    }

    #[test]
    fn direct_write_and_read() {
        let fx = fixture();
        let mut data = FileDataAttr::new_direct();
        data.size = 5;
        assert_eq!(
            write_stream(&fx.io, &fx.sb, &mut data, 0, b"hello").unwrap(),
            None
        );

        let mut back = [0_u8; 5];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(&back, b"hello");
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Direct);
    }

    #[test]
    fn access_beyond_size_rejected() {
        let fx = fixture();
        let mut data = FileDataAttr::new_direct();
        data.size = 5;
        let mut buf = [0_u8; 6];
        assert!(matches!(
            read_stream(&fx.io, &fx.sb, &data, 0, &mut buf),
            Err(EsfsError::IncorrectFileAccess)
        ));
        assert!(matches!(
            write_stream(&fx.io, &fx.sb, &mut data, 3, b"abc"),
            Err(EsfsError::IncorrectFileAccess)
        ));
    }

    #[test]
    fn grow_within_direct_zeroes_tail() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        data.size = 5;
        write_stream(&fx.io, &fx.sb, &mut data, 0, b"hello").unwrap();

        resize(&mut fx, &mut data, 30, true).unwrap();
        assert_eq!(data.size, 30);
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Direct);

        let mut back = [0xFF_u8; 30];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(&back[..5], b"hello");
        assert!(back[5..].iter().all(|b| *b == 0));
        // No blocks were allocated.
        assert_eq!(fx.sb.blocks_used, 2);
    }

    #[test]
    fn promotion_to_indirect_preserves_prefix() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        data.size = 5;
        write_stream(&fx.io, &fx.sb, &mut data, 0, b"hello").unwrap();

        resize(&mut fx, &mut data, 100, true).unwrap();
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Indirect);
        assert_eq!(data.extent_count, 1);
        assert_eq!(data.size, 100);

        let mut back = vec![0xFF_u8; 100];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(&back[..5], b"hello");
        assert!(back[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn resize_to_same_size_is_noop() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        resize(&mut fx, &mut data, 100, true).unwrap();
        let before_attr = data.clone();
        let before_used = fx.sb.blocks_used;

        resize(&mut fx, &mut data, 100, true).unwrap();
        assert_eq!(data, before_attr);
        assert_eq!(fx.sb.blocks_used, before_used);
    }

    #[test]
    fn multi_extent_grow_reads_back_faithfully() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        // Three fragmented single-block extents.
        for _ in 0..3 {
            grow_one_fragmented_block(&mut fx, &mut data);
        }
        assert_eq!(data.extent_count, 3);
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Indirect);

        let payload: Vec<u8> = (0..3 * BLOCK_SIZE as usize)
            .map(|i| (i % 241) as u8)
            .collect();
        write_stream(&fx.io, &fx.sb, &mut data, 0, &payload).unwrap();
        let mut back = vec![0_u8; payload.len()];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(back, payload);

        // Unaligned inner range.
        let mut middle = vec![0_u8; 700];
        read_stream(&fx.io, &fx.sb, &data, 300, &mut middle).unwrap();
        assert_eq!(middle[..], payload[300..1000]);
    }

    #[test]
    fn promotion_to_indirect_2_and_demotion_back() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        let payload: Vec<u8> = (0..5 * BLOCK_SIZE as usize)
            .map(|i| (i % 199) as u8)
            .collect();

        for _ in 0..5 {
            grow_one_fragmented_block(&mut fx, &mut data);
        }
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Indirect2);
        assert_eq!(data.extent_count, 5);
        let DataPayload::Indirect2(blocks) = &data.payload else {
            panic!("expected indirect2 payload");
        };
        assert_ne!(blocks[0], 0);
        let list_block = blocks[0];

        write_stream(&fx.io, &fx.sb, &mut data, 0, &payload).unwrap();
        let mut back = vec![0_u8; payload.len()];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(back, payload);

        // Shrink to three blocks: demotes to INDIRECT and frees the
        // extent-list block.
        let used_before = fx.sb.blocks_used;
        resize(&mut fx, &mut data, 3 * BLOCK_SIZE, false).unwrap();
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Indirect);
        assert_eq!(data.extent_count, 3);
        // Two data blocks plus the list block came back.
        assert_eq!(fx.sb.blocks_used, used_before - 3);

        let mut back = vec![0_u8; 3 * BLOCK_SIZE as usize];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(back[..], payload[..3 * BLOCK_SIZE as usize]);

        // The freed list block is back on the free list.
        let free = esfs_alloc::available_extents(&fx.io, &fx.sb, &fx.gdt, 0).unwrap();
        assert!(free.iter().any(|extent| {
            u64::from(extent.offset) <= list_block && list_block < u64::from(extent.end())
        }));
    }

    #[test]
    fn shrink_to_direct_preserves_prefix_and_frees_everything() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        let baseline = fx.sb.blocks_used;

        resize(&mut fx, &mut data, 2 * BLOCK_SIZE, true).unwrap();
        let payload: Vec<u8> = (0..2 * BLOCK_SIZE as usize)
            .map(|i| (i % 101) as u8)
            .collect();
        write_stream(&fx.io, &fx.sb, &mut data, 0, &payload).unwrap();

        resize(&mut fx, &mut data, 40, false).unwrap();
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Direct);
        assert_eq!(data.extent_count, 0);
        assert_eq!(data.size, 40);
        // Every block came back.
        assert_eq!(fx.sb.blocks_used, baseline);

        let mut back = [0_u8; 40];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(back[..], payload[..40]);
    }

    #[test]
    fn shrink_to_zero_empties_the_stream() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        let baseline = fx.sb.blocks_used;
        resize(&mut fx, &mut data, 3 * BLOCK_SIZE, true).unwrap();

        resize(&mut fx, &mut data, 0, false).unwrap();
        assert_eq!(data.size, 0);
        assert_eq!(data.indirection(), esfs_ondisk::Indirection::Direct);
        assert_eq!(fx.sb.blocks_used, baseline);
    }

    #[test]
    fn shrink_keeps_partial_extent() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        resize(&mut fx, &mut data, 4 * BLOCK_SIZE, true).unwrap();
        assert_eq!(data.extent_count, 1);
        let payload: Vec<u8> = (0..4 * BLOCK_SIZE as usize)
            .map(|i| (i % 89) as u8)
            .collect();
        write_stream(&fx.io, &fx.sb, &mut data, 0, &payload).unwrap();

        // Two blocks survive out of the four-block extent.
        resize(&mut fx, &mut data, 2 * BLOCK_SIZE, false).unwrap();
        assert_eq!(data.extent_count, 1);
        let mut back = vec![0_u8; 2 * BLOCK_SIZE as usize];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(back[..], payload[..2 * BLOCK_SIZE as usize]);
    }

    #[test]
    fn failed_grow_rolls_back_allocations() {
        let mut fx = fixture();
        // A file that consumes almost everything.
        let mut hog = FileDataAttr::new_direct();
        let free: u64 = esfs_alloc::available_extents(&fx.io, &fx.sb, &fx.gdt, 0)
            .unwrap()
            .iter()
            .map(|extent| u64::from(extent.count))
            .sum();
        resize(&mut fx, &mut hog, (free - 2) * BLOCK_SIZE, false).unwrap();

        let mut data = FileDataAttr::new_direct();
        let attr_before = data.clone();
        let used_before = fx.sb.blocks_used;

        // Needs far more than the volume has left (every group, not just
        // group 0, must come up empty).
        let demand = BLOCK_COUNT * BLOCK_SIZE * 2;
        let result = resize(&mut fx, &mut data, demand, false);
        assert!(matches!(result, Err(EsfsError::NoSpace)));

        // The attribute is unchanged and every allocated extent came back;
        // only the extent tables of the groups initialised along the way
        // remain in use.
        assert_eq!(data, attr_before);
        assert_eq!(fx.sb.blocks_used, used_before + (GROUP_COUNT - 1));
        let descriptor_total: u64 = fx.gdt.iter().map(|d| u64::from(d.blocks_used)).sum();
        assert_eq!(fx.sb.blocks_used, descriptor_total);
    }

    #[test]
    fn resize_idempotence_preserves_prefix() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        let n = 3 * BLOCK_SIZE;
        let m = 6 * BLOCK_SIZE;

        resize(&mut fx, &mut data, n, true).unwrap();
        let payload: Vec<u8> = (0..n as usize).map(|i| (i % 47) as u8).collect();
        write_stream(&fx.io, &fx.sb, &mut data, 0, &payload).unwrap();

        resize(&mut fx, &mut data, m, true).unwrap();
        resize(&mut fx, &mut data, n, false).unwrap();

        let mut back = vec![0_u8; n as usize];
        read_stream(&fx.io, &fx.sb, &data, 0, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn get_block_resolves_every_offset() {
        let mut fx = fixture();
        let mut data = FileDataAttr::new_direct();
        for _ in 0..3 {
            grow_one_fragmented_block(&mut fx, &mut data);
        }

        let mut seen = Vec::new();
        for block in 0..3 {
            let global =
                get_block_from_stream(&fx.io, &fx.sb, &data, block * BLOCK_SIZE).unwrap();
            assert!(global >= 2);
            assert!(!seen.contains(&global));
            seen.push(global);
        }
        assert!(get_block_from_stream(&fx.io, &fx.sb, &data, 3 * BLOCK_SIZE).is_err());
    }
}
