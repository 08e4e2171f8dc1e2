#![forbid(unsafe_code)]
//! Group-partitioned extent allocation.
//!
//! Every block group owns a table of free local extents. Allocation
//! scans groups starting at a caller-supplied locality hint, splitting
//! or consuming free extents; a group with no single extent large enough
//! yields a partial allocation (its largest extent) and the caller loops.
//! Freeing converts back to a local extent and merges with its
//! neighbours in the table.

use esfs_block::BlockIo;
use esfs_error::{EsfsError, Result};
use esfs_ondisk::{GroupDescriptor, Superblock};
use esfs_types::{
    blocks_needed_to_store, u64_to_usize, GlobalExtent, LocalExtent, LOCAL_EXTENT_SIZE,
};
use tracing::{debug, trace};

fn corruption(block: u64, detail: impl Into<String>) -> EsfsError {
    EsfsError::Corruption {
        block,
        detail: detail.into(),
    }
}

/// Reject a descriptor whose table no longer fits its reserved blocks.
fn check_table_budget(sb: &Superblock, descriptor: &GroupDescriptor) -> Result<()> {
    let table_bytes = u64::from(descriptor.extent_count) * LOCAL_EXTENT_SIZE as u64;
    if table_bytes > sb.blocks_per_group_extent_table * sb.block_size {
        return Err(corruption(
            descriptor.extent_table,
            "extent table larger than its reserved blocks",
        ));
    }
    Ok(())
}

fn read_extent_table(
    io: &BlockIo,
    sb: &Superblock,
    descriptor: &GroupDescriptor,
) -> Result<Vec<LocalExtent>> {
    check_table_budget(sb, descriptor)?;
    let count = usize::from(descriptor.extent_count);
    let blocks = blocks_needed_to_store((count * LOCAL_EXTENT_SIZE) as u64, sb.block_size);
    if blocks == 0 {
        return Ok(Vec::new());
    }

    let mut raw = vec![0_u8; u64_to_usize(blocks * sb.block_size, "extent_table")?];
    io.read_blocks(descriptor.extent_table, &mut raw)?;

    let mut table = Vec::with_capacity(count);
    for index in 0..count {
        table.push(LocalExtent::decode(&raw, index * LOCAL_EXTENT_SIZE)?);
    }
    Ok(table)
}

fn write_extent_table(
    io: &BlockIo,
    sb: &Superblock,
    descriptor: &GroupDescriptor,
    table: &[LocalExtent],
) -> Result<()> {
    let blocks = blocks_needed_to_store((table.len() * LOCAL_EXTENT_SIZE) as u64, sb.block_size);
    if blocks == 0 {
        return Ok(());
    }
    let mut raw = vec![0_u8; u64_to_usize(blocks * sb.block_size, "extent_table")?];
    for (index, extent) in table.iter().enumerate() {
        raw[index * LOCAL_EXTENT_SIZE..(index + 1) * LOCAL_EXTENT_SIZE]
            .copy_from_slice(&extent.encode());
    }
    io.write_blocks(descriptor.extent_table, &raw)
}

fn narrow_count(value: u64, context: &'static str) -> Result<u16> {
    u16::try_from(value).map_err(|_| corruption(0, context))
}

/// Allocate an extent of at most `desired_blocks` blocks, preferring
/// `local_group` and wrapping through every group.
///
/// A result shorter than `desired_blocks` is a partial allocation; the
/// caller loops until it has covered the request. `EsfsError::NoSpace`
/// means every group is full.
pub fn allocate_extent(
    io: &BlockIo,
    sb: &mut Superblock,
    gdt: &mut [GroupDescriptor],
    local_group: u64,
    desired_blocks: u64,
) -> Result<GlobalExtent> {
    if desired_blocks == 0 {
        return Err(EsfsError::Format("cannot allocate 0 blocks".to_owned()));
    }

    let group_count = sb.group_count;
    if group_count == 0 {
        return Err(EsfsError::NoSpace);
    }
    let mut group = local_group % group_count;

    for _ in 0..group_count {
        let searched = group;
        group = (group + 1) % group_count;

        let group_index = u64_to_usize(searched, "group")?;
        let descriptor = &mut gdt[group_index];
        let blocks_in_group = sb.blocks_in_group(searched);

        if u64::from(descriptor.blocks_used) == blocks_in_group {
            continue;
        }

        check_table_budget(sb, descriptor)?;

        let mut table;
        if descriptor.extent_table == 0 {
            // Lazily initialise the group: the extent table occupies its
            // first blocks, and one extent covers the remainder.
            descriptor.extent_table = searched * u64::from(sb.blocks_per_group);
            descriptor.extent_count = 1;
            descriptor.blocks_used = narrow_count(
                sb.blocks_per_group_extent_table,
                "extent table block count",
            )?;
            sb.blocks_used += sb.blocks_per_group_extent_table;
            table = vec![LocalExtent {
                offset: narrow_count(sb.blocks_per_group_extent_table, "extent table offset")?,
                count: narrow_count(
                    blocks_in_group - sb.blocks_per_group_extent_table,
                    "group size",
                )?,
            }];
            debug!(
                target: "esfs::alloc",
                group = searched,
                extent_table = descriptor.extent_table,
                "initialised group"
            );
        } else {
            table = read_extent_table(io, sb, descriptor)?;
        }

        // First pass: an extent that covers the whole request, split or
        // consumed outright. Track the largest undersized extent with its
        // count starting from zero so a partial allocation never follows
        // stale state.
        let mut allocation: Option<LocalExtent> = None;
        let mut largest_index = 0_usize;
        let mut largest_count = 0_u16;

        for index in 0..table.len() {
            let candidate = table[index];
            if u64::from(candidate.count) > desired_blocks {
                let take = narrow_count(desired_blocks, "allocation size")?;
                table[index].offset += take;
                table[index].count -= take;
                allocation = Some(LocalExtent {
                    offset: candidate.offset,
                    count: take,
                });
                break;
            } else if u64::from(candidate.count) == desired_blocks {
                table.swap_remove(index);
                allocation = Some(candidate);
                break;
            } else if candidate.count > largest_count {
                largest_index = index;
                largest_count = candidate.count;
            }
        }

        let local = match allocation {
            Some(local) => local,
            None => {
                if table.is_empty() {
                    // The table is exhausted even though the descriptor
                    // claims free blocks; skip rather than trust it.
                    continue;
                }
                // Partial allocation: hand back the largest extent whole.
                let local = table[largest_index];
                table.swap_remove(largest_index);
                local
            }
        };

        let extent = GlobalExtent {
            offset: searched * u64::from(sb.blocks_per_group) + u64::from(local.offset),
            count: u64::from(local.count),
        };

        descriptor.blocks_used += local.count;
        sb.blocks_used += extent.count;
        descriptor.extent_count = narrow_count(table.len() as u64, "extent count")?;
        write_extent_table(io, sb, descriptor, &table)?;

        trace!(
            target: "esfs::alloc",
            group = searched,
            offset = extent.offset,
            count = extent.count,
            desired = desired_blocks,
            "allocated extent"
        );
        return Ok(extent);
    }

    debug!(target: "esfs::alloc", desired = desired_blocks, "volume full");
    Err(EsfsError::NoSpace)
}

/// Return `extent` to its group's free table, merging with adjacent free
/// extents. Overlap with an existing free extent is a consistency failure.
pub fn free_extent(
    io: &BlockIo,
    sb: &mut Superblock,
    gdt: &mut [GroupDescriptor],
    extent: GlobalExtent,
) -> Result<()> {
    if extent.is_empty() {
        return Ok(());
    }

    let blocks_per_group = u64::from(sb.blocks_per_group);
    let group = extent.offset / blocks_per_group;
    let group_index = u64_to_usize(group, "group")?;
    let descriptor = gdt
        .get_mut(group_index)
        .ok_or_else(|| corruption(extent.offset, "freed extent beyond the last group"))?;

    let count = narrow_count(extent.count, "freed extent count")?;
    descriptor.blocks_used = descriptor
        .blocks_used
        .checked_sub(count)
        .ok_or_else(|| corruption(extent.offset, "group accounting underflow"))?;
    sb.blocks_used = sb
        .blocks_used
        .checked_sub(extent.count)
        .ok_or_else(|| corruption(extent.offset, "volume accounting underflow"))?;

    let mut table = read_extent_table(io, sb, descriptor)?;
    let mut freed = LocalExtent {
        offset: narrow_count(extent.offset % blocks_per_group, "freed extent offset")?,
        count,
    };

    // Merge with neighbours; a partially contained extent means the free
    // list and a live stream disagree about ownership.
    let mut index = 0;
    while index < table.len() {
        let existing = table[index];
        let existing_end = existing.end();
        let freed_end = freed.end();

        if (existing_end > u32::from(freed.offset) && existing_end < freed_end)
            || (freed_end > u32::from(existing.offset) && freed_end < existing_end)
        {
            return Err(corruption(extent.offset, "free extent overlap"));
        }

        if existing_end == u32::from(freed.offset) {
            freed = LocalExtent {
                offset: existing.offset,
                count: merged_count(existing.count, freed.count, extent.offset)?,
            };
            table.swap_remove(index);
            continue;
        }
        if freed_end == u32::from(existing.offset) {
            freed.count = merged_count(existing.count, freed.count, extent.offset)?;
            table.swap_remove(index);
            continue;
        }
        index += 1;
    }

    table.push(freed);
    descriptor.extent_count = narrow_count(table.len() as u64, "extent count")?;
    check_table_budget(sb, descriptor)?;
    write_extent_table(io, sb, descriptor, &table)?;

    trace!(
        target: "esfs::alloc",
        group,
        offset = extent.offset,
        count = extent.count,
        "freed extent"
    );
    Ok(())
}

fn merged_count(a: u16, b: u16, at: u64) -> Result<u16> {
    u32::from(a)
        .checked_add(u32::from(b))
        .and_then(|sum| u16::try_from(sum).ok())
        .ok_or_else(|| corruption(at, "merged extent exceeds group size"))
}

/// The free extents of `group`, as stored in its table. An uninitialised
/// group is reported as one extent covering the whole group.
pub fn available_extents(
    io: &BlockIo,
    sb: &Superblock,
    gdt: &[GroupDescriptor],
    group: u64,
) -> Result<Vec<LocalExtent>> {
    if group >= sb.group_count {
        return Err(EsfsError::NotFound(format!(
            "group {group} (volume has {})",
            sb.group_count
        )));
    }
    let descriptor = &gdt[u64_to_usize(group, "group")?];
    if descriptor.extent_table == 0 {
        return Ok(vec![LocalExtent {
            offset: 0,
            count: narrow_count(sb.blocks_in_group(group), "group size")?,
        }]);
    }
    read_extent_table(io, sb, descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use esfs_block::MemoryDevice;
    use esfs_types::{BlockSize, UniqueIdentifier, MAX_VOLUME_NAME_LENGTH};
    use std::sync::Arc;

    const BLOCK_SIZE: u64 = 512;
    const BLOCKS_PER_GROUP: u16 = 64;
    const GROUP_COUNT: u64 = 4;
    const BLOCK_COUNT: u64 = 250; // Last group holds 58 blocks.

    fn fixture() -> (BlockIo, Superblock, Vec<GroupDescriptor>) {
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
            gdt: esfs_types::LocalExtent { offset: 0, count: 1 },
            root_directory_file_entry: esfs_types::LocalExtent { offset: 1, count: 1 },
            identifier: UniqueIdentifier::ZERO,
            os_installation: UniqueIdentifier::ZERO,
        };

        // Group 0 is initialised the way format leaves it: blocks 0..2
        // hold metadata, block 1 holds the extent table, 62 blocks free.
        let mut gdt = vec![GroupDescriptor::default(); GROUP_COUNT as usize];
        gdt[0] = GroupDescriptor {
            extent_table: 1,
            extent_count: 1,
            blocks_used: 2,
        };
        write_extent_table(
            &io,
            &sb,
            &gdt[0],
            &[LocalExtent {
                offset: 2,
                count: 62,
            }],
        )
        .unwrap();

        (io, sb, gdt)
    }

    fn free_blocks_in_group(
        io: &BlockIo,
        sb: &Superblock,
        gdt: &[GroupDescriptor],
        group: u64,
    ) -> u64 {
        available_extents(io, sb, gdt, group)
            .unwrap()
            .iter()
            .map(|extent| u64::from(extent.count))
            .sum()
    }

    #[test]
    fn split_allocation_takes_prefix() {
        let (io, mut sb, mut gdt) = fixture();
        let extent = allocate_extent(&io, &mut sb, &mut gdt, 0, 10).unwrap();
        assert_eq!(extent, GlobalExtent { offset: 2, count: 10 });
        assert_eq!(gdt[0].blocks_used, 12);
        assert_eq!(sb.blocks_used, 12);

        let table = available_extents(&io, &sb, &gdt, 0).unwrap();
        assert_eq!(table, vec![LocalExtent { offset: 12, count: 52 }]);
    }

    #[test]
    fn exact_fit_consumes_extent() {
        let (io, mut sb, mut gdt) = fixture();
        let extent = allocate_extent(&io, &mut sb, &mut gdt, 0, 62).unwrap();
        assert_eq!(extent.count, 62);
        assert_eq!(gdt[0].extent_count, 0);
        assert_eq!(u64::from(gdt[0].blocks_used), sb.blocks_in_group(0));
    }

    #[test]
    fn partial_allocation_returns_largest_extent() {
        let (io, mut sb, mut gdt) = fixture();
        // Fragment group 0 into free extents of 2 and 3 blocks:
        // take 10, free back [4..6) and [9..12).
        let big = allocate_extent(&io, &mut sb, &mut gdt, 0, 10).unwrap();
        assert_eq!(big.offset, 2);
        let _rest = allocate_extent(&io, &mut sb, &mut gdt, 0, 52).unwrap();
        assert_eq!(free_blocks_in_group(&io, &sb, &gdt, 0), 0);
        free_extent(&io, &mut sb, &mut gdt, GlobalExtent { offset: 4, count: 2 }).unwrap();
        free_extent(&io, &mut sb, &mut gdt, GlobalExtent { offset: 9, count: 3 }).unwrap();

        // Nothing satisfies 5 blocks; the largest extent (3) comes back.
        let partial = allocate_extent(&io, &mut sb, &mut gdt, 0, 5).unwrap();
        assert_eq!(partial, GlobalExtent { offset: 9, count: 3 });

        // The remaining 2-block extent covers the rest.
        let next = allocate_extent(&io, &mut sb, &mut gdt, 0, 2).unwrap();
        assert_eq!(next, GlobalExtent { offset: 4, count: 2 });
    }

    #[test]
    fn allocation_wraps_to_next_group_and_lazily_initialises() {
        let (io, mut sb, mut gdt) = fixture();
        // Exhaust group 0.
        allocate_extent(&io, &mut sb, &mut gdt, 0, 62).unwrap();

        let extent = allocate_extent(&io, &mut sb, &mut gdt, 0, 5).unwrap();
        // Group 1 initialises with its extent table in its first block.
        assert_eq!(gdt[1].extent_table, 64);
        assert_eq!(extent, GlobalExtent { offset: 65, count: 5 });
        assert_eq!(gdt[1].blocks_used, 6); // table + allocation
    }

    #[test]
    fn free_merges_with_both_neighbours() {
        let (io, mut sb, mut gdt) = fixture();
        let a = allocate_extent(&io, &mut sb, &mut gdt, 0, 4).unwrap();
        let b = allocate_extent(&io, &mut sb, &mut gdt, 0, 4).unwrap();
        let c = allocate_extent(&io, &mut sb, &mut gdt, 0, 4).unwrap();
        assert_eq!(b.offset, a.offset + 4);
        assert_eq!(c.offset, b.offset + 4);

        // `c` borders the free tail and merges into it; `a` stands alone.
        free_extent(&io, &mut sb, &mut gdt, a).unwrap();
        free_extent(&io, &mut sb, &mut gdt, c).unwrap();
        assert_eq!(available_extents(&io, &sb, &gdt, 0).unwrap().len(), 2);

        // Freeing b bridges everything back into one pristine extent.
        free_extent(&io, &mut sb, &mut gdt, b).unwrap();
        let table = available_extents(&io, &sb, &gdt, 0).unwrap();
        assert_eq!(table, vec![LocalExtent { offset: 2, count: 62 }]);
        assert_eq!(sb.blocks_used, 2);
    }

    #[test]
    fn free_detects_partial_overlap() {
        let (io, mut sb, mut gdt) = fixture();
        let extent = allocate_extent(&io, &mut sb, &mut gdt, 0, 8).unwrap();
        free_extent(&io, &mut sb, &mut gdt, extent).unwrap();

        // Straddles the free extent's end.
        sb.blocks_used += 6;
        gdt[0].blocks_used += 6;
        let overlapping = GlobalExtent {
            offset: extent.offset + 4,
            count: 6,
        };
        assert!(matches!(
            free_extent(&io, &mut sb, &mut gdt, overlapping),
            Err(EsfsError::Corruption { .. })
        ));
    }

    #[test]
    fn volume_fills_up_and_reports_no_space() {
        let (io, mut sb, mut gdt) = fixture();
        let mut total = 0_u64;
        loop {
            match allocate_extent(&io, &mut sb, &mut gdt, 0, 16) {
                Ok(extent) => total += extent.count,
                Err(EsfsError::NoSpace) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        // Everything except the per-group extent tables and the two
        // metadata blocks of group 0 was handed out.
        let capacity = BLOCK_COUNT - 2 - (GROUP_COUNT - 1);
        assert_eq!(total, capacity);
        assert_eq!(sb.blocks_used, BLOCK_COUNT);
    }

    #[test]
    fn accounting_invariant_holds_per_group() {
        let (io, mut sb, mut gdt) = fixture();
        let a = allocate_extent(&io, &mut sb, &mut gdt, 0, 7).unwrap();
        let _b = allocate_extent(&io, &mut sb, &mut gdt, 1, 9).unwrap();
        free_extent(&io, &mut sb, &mut gdt, a).unwrap();

        let mut used_total = 0_u64;
        for group in 0..GROUP_COUNT {
            let descriptor = &gdt[group as usize];
            used_total += u64::from(descriptor.blocks_used);
            if descriptor.extent_table != 0 {
                let free = free_blocks_in_group(&io, &sb, &gdt, group);
                assert_eq!(
                    free + u64::from(descriptor.blocks_used),
                    sb.blocks_in_group(group)
                );
            }
        }
        assert_eq!(sb.blocks_used, used_total);
    }

    #[test]
    fn zero_block_request_rejected() {
        let (io, mut sb, mut gdt) = fixture();
        assert!(allocate_extent(&io, &mut sb, &mut gdt, 0, 0).is_err());
    }
}
