//! Selection of the memory the faulting thread's stack points into.
//!
//! Thread stacks and modules are always part of a minidump, the objects the
//! faulting code was working with are not. Every pointer sized value in the
//! captured stack that falls inside a readable data mapping adds a small
//! window around the address it points at.

use fault_bridge::StackSnapshot;
use std::ops::Range;

/// How much memory before a referenced address is included
const BYTES_BEFORE: u64 = 64;
/// How much memory from a referenced address on is included
const BYTES_AFTER: u64 = 192;
/// The most references followed for one dump, the ones nearest to the stack
/// pointer are kept
const MAX_REFERENCES: usize = 1024;

/// A readable, non executable mapping of the process
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DataMapping {
    pub(crate) range: Range<u64>,
}

/// Parses the mappings that may be read for their data out of the contents of
/// `/proc/<pid>/maps`.
///
/// Code, special kernel mappings and device mappings are skipped, as is the
/// main thread's stack, which is part of the dump anyways.
pub(crate) fn data_mappings(maps: &str) -> Vec<DataMapping> {
    let mut mappings: Vec<_> = maps.lines().filter_map(parse_mapping).collect();
    mappings.sort_by_key(|mapping| mapping.range.start);
    mappings
}

fn parse_mapping(line: &str) -> Option<DataMapping> {
    let mut fields = line.split_whitespace();

    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.as_bytes();
    // offset, device, inode
    let path = fields.nth(3).unwrap_or_default();

    if perms.len() < 3 || perms[0] != b'r' || perms[2] == b'x' {
        return None;
    }

    if (path.starts_with('[') && path != "[heap]") || path.starts_with("/dev/") {
        return None;
    }

    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    (start < end).then_some(DataMapping { range: start..end })
}

/// The address ranges to add to a dump of the thread `stack` belongs to,
/// sorted and without overlaps
pub(crate) fn referenced_regions(stack: &StackSnapshot, mappings: &[DataMapping]) -> Vec<Range<u64>> {
    let find = |addr: u64| {
        let index = mappings.partition_point(|mapping| mapping.range.start <= addr);
        index
            .checked_sub(1)
            .map(|index| &mappings[index])
            .filter(|mapping| mapping.range.contains(&addr))
    };

    // The stack's own mapping is dumped as part of the thread
    let own_stack = find(stack.base).map(|mapping| mapping.range.clone());

    let mut regions = Vec::new();
    for word in stack.bytes.chunks_exact(8) {
        if regions.len() >= MAX_REFERENCES {
            break;
        }

        let Ok(word) = <[u8; 8]>::try_from(word) else {
            continue;
        };
        let value = u64::from_ne_bytes(word);

        let Some(mapping) = find(value) else { continue };
        if Some(&mapping.range) == own_stack.as_ref() {
            continue;
        }

        let start = value.saturating_sub(BYTES_BEFORE).max(mapping.range.start);
        let end = value.saturating_add(BYTES_AFTER).min(mapping.range.end);
        regions.push(start..end);
    }

    merge(regions)
}

fn merge(mut regions: Vec<Range<u64>>) -> Vec<Range<u64>> {
    regions.sort_by_key(|region| region.start);

    let mut merged: Vec<Range<u64>> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(last) if region.start <= last.end => last.end = last.end.max(region.end),
            _ => merged.push(region),
        }
    }

    merged
}
