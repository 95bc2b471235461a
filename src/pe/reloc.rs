// we use identifier names from the C headers for PE structures,
// which don't match the Rust style guide.
#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use anyhow::Result;
use log::{debug, warn};

use crate::{
    addr::{Raw, Rva, Va},
    aspace::ImageBuf,
    pe::{dirs::DirectoryAnchor, section::SectionMap},
};

/// The base relocation is skipped; pads a block to 4-byte alignment.
/// May appear mid-block, not only at the end.
pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
/// Apply all 32 bits of the delta to the dword at the offset.
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
/// Apply the delta to the qword at the offset.
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

const sizeof_BLOCK_HEADER: u64 = 8;
const sizeof_ENTRY: u64 = 2;

/// One relocation block (one page), indexing into the flat offset list.
/// ABSOLUTE padding entries are preserved as `None` holes in that list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocationBlock {
    pub page_va:            Va,
    pub first_offset_index: usize,
    pub count:              usize,
}

#[derive(Default)]
pub struct RelocationData {
    pub blocks:  Vec<RelocationBlock>,
    /// RAW offsets needing patching; `None` marks an ABSOLUTE hole.
    pub offsets: Vec<Option<Raw>>,
}

pub fn read_relocations(
    buf: &ImageBuf,
    map: &SectionMap,
    anchor: &DirectoryAnchor,
) -> Result<RelocationData> {
    let mut data = RelocationData::default();

    if !anchor.is_present() {
        return Ok(data);
    }

    let dir_rva = map.va_to_rva(anchor.va);
    let mut cursor = 0u64;

    while cursor + sizeof_BLOCK_HEADER <= anchor.size as u64 {
        let block_raw = map.rva_to_raw(Rva(dir_rva.0 + cursor));
        if block_raw.is_null() {
            warn!("relocs: block at +{:#x} not mapped", cursor);
            return Ok(data);
        }

        let page_rva = buf.read_u32(block_raw)? as u64;
        let size_of_block = buf.read_u32(block_raw + 4)? as u64;

        if size_of_block < sizeof_BLOCK_HEADER {
            warn!("relocs: runt block at +{:#x}", cursor);
            return Ok(data);
        }
        if cursor + size_of_block > anchor.size as u64 {
            // block claims more entries than the directory holds.
            warn!("relocs: block at +{:#x} overruns directory", cursor);
            return Ok(data);
        }

        let entry_count = ((size_of_block - sizeof_BLOCK_HEADER) / sizeof_ENTRY) as usize;
        debug!("relocs: block: {:#x} {} entries", page_rva, entry_count);

        let first_offset_index = data.offsets.len();

        for entry_index in 0..entry_count as u64 {
            let entry = buf.read_u16(block_raw + sizeof_BLOCK_HEADER + entry_index * sizeof_ENTRY)?;
            let entry_type = entry >> 12;
            let entry_offset = (entry & 0x0FFF) as u64;

            match entry_type {
                // padding hole: skip it, but do not terminate the block.
                IMAGE_REL_BASED_ABSOLUTE => data.offsets.push(None),
                IMAGE_REL_BASED_HIGHLOW | IMAGE_REL_BASED_DIR64 => {
                    let raw = map.rva_to_raw(Rva(page_rva + entry_offset));
                    if raw.is_null() {
                        warn!("relocs: target not mapped: {:#x}", page_rva + entry_offset);
                        data.offsets.push(None);
                    } else {
                        data.offsets.push(Some(raw));
                    }
                }
                other => {
                    warn!("relocs: unsupported type {} at {:#x}", other, page_rva + entry_offset);
                    return Ok(data);
                }
            }
        }

        data.blocks.push(RelocationBlock {
            page_va: map.rva_to_va(Rva(page_rva)),
            first_offset_index,
            count: entry_count,
        });

        cursor += size_of_block;
    }

    Ok(data)
}

/// Patch every recorded slot by `delta`, in place, in the file image.
///
/// `delta` is runtime base minus preferred base; on 32-bit images only
/// the low 32 bits are applied. Wrap-around arithmetic, matching the
/// loader. Returns the number of slots patched.
pub fn apply_relocations(
    buf: &mut ImageBuf,
    data: &RelocationData,
    is_64: bool,
    delta: i64,
) -> Result<usize> {
    if delta == 0 {
        debug!("relocs: no relocations necessary");
        return Ok(0);
    }

    let mut patched = 0;
    for offset in data.offsets.iter().flatten() {
        if is_64 {
            let existing = buf.read_u64(*offset)?;
            buf.write_u64(*offset, existing.wrapping_add(delta as u64))?;
        } else {
            let existing = buf.read_u32(*offset)?;
            buf.write_u32(*offset, existing.wrapping_add(delta as u32))?;
        }
        patched += 1;
    }

    debug!("relocs: applied {} relocations (delta {:#x})", patched, delta);

    Ok(patched)
}
