// we use identifier names from the C headers for PE structures,
// which don't match the Rust style guide.
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

use crate::{
    addr::{Rva, Va},
    pe::{headers::NtHeaders, section::SectionMap},
};

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_EXCEPTION: usize = 3;
pub const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
pub const IMAGE_DIRECTORY_ENTRY_ARCHITECTURE: usize = 7;
pub const IMAGE_DIRECTORY_ENTRY_GLOBALPTR: usize = 8;
pub const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;
pub const IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG: usize = 10;
pub const IMAGE_DIRECTORY_ENTRY_BOUND_IMPORT: usize = 11;
pub const IMAGE_DIRECTORY_ENTRY_IAT: usize = 12;
pub const IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT: usize = 13;
pub const IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR: usize = 14;
pub const IMAGE_DIRECTORY_ENTRY_RESERVED: usize = 15;

pub const DIRECTORY_COUNT: usize = 16;

/// A data directory as a region of the loaded image.
/// `va` is `Va::NULL` iff the directory is absent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryAnchor {
    pub va:   Va,
    pub size: u32,
}

impl DirectoryAnchor {
    pub fn is_present(&self) -> bool {
        !self.va.is_null()
    }
}

/// Materialize the 16 directory entries as VA-anchored regions.
pub fn materialize(nt: &NtHeaders, map: &SectionMap) -> [DirectoryAnchor; DIRECTORY_COUNT] {
    let mut anchors = [DirectoryAnchor::default(); DIRECTORY_COUNT];
    for (i, anchor) in anchors.iter_mut().enumerate() {
        let dir = &nt.optional.DataDirectory[i];
        if dir.VirtualAddress != 0 {
            anchor.va = map.rva_to_va(Rva(dir.VirtualAddress as u64));
            anchor.size = dir.Size;
        }
    }
    anchors
}

/// Which directory contains the RVA?
///
/// Scans from the highest index down so that pathological overlaps
/// (e.g. a `Security` directory whose size spans into `BaseRelocations`)
/// resolve to the later-defined directory.
pub fn directory_index_from_rva(
    anchors: &[DirectoryAnchor; DIRECTORY_COUNT],
    map: &SectionMap,
    rva: Rva,
) -> Option<usize> {
    for index in (0..DIRECTORY_COUNT).rev() {
        let anchor = &anchors[index];
        if !anchor.is_present() {
            continue;
        }
        let start = map.va_to_rva(anchor.va);
        if rva.0 >= start.0 && rva.0 < start.0 + anchor.size as u64 {
            return Some(index);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Va;

    fn flat_map(base: u64) -> SectionMap {
        SectionMap {
            image_base:        Va(base),
            virtual_size:      0x10_0000,
            size_of_headers:   0x400,
            section_alignment: 0x1000,
            file_alignment:    0x200,
            sections:          vec![],
        }
    }

    #[test]
    fn highest_index_wins() {
        let map = flat_map(0x0040_0000);

        let mut anchors = [DirectoryAnchor::default(); DIRECTORY_COUNT];
        // security spans 0x3000..0x6000, overlapping relocations at 0x5000.
        anchors[IMAGE_DIRECTORY_ENTRY_SECURITY] = DirectoryAnchor {
            va:   Va(0x0040_3000),
            size: 0x3000,
        };
        anchors[IMAGE_DIRECTORY_ENTRY_BASERELOC] = DirectoryAnchor {
            va:   Va(0x0040_5000),
            size: 0x1000,
        };

        assert_eq!(
            directory_index_from_rva(&anchors, &map, Rva(0x5800)),
            Some(IMAGE_DIRECTORY_ENTRY_BASERELOC)
        );
        assert_eq!(
            directory_index_from_rva(&anchors, &map, Rva(0x3800)),
            Some(IMAGE_DIRECTORY_ENTRY_SECURITY)
        );
        assert_eq!(directory_index_from_rva(&anchors, &map, Rva(0x9000)), None);
    }
}
