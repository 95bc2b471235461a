//! Sections, and the only place where RAW, RVA and VA may be converted
//! into one another.
use bitflags::bitflags;

use crate::{
    addr::{Raw, Rva, Va},
    util::{align, align_down},
};

bitflags! {
    pub struct SectionCharacteristics: u32 {
        const CNT_CODE               = 0x0000_0020;
        const CNT_INITIALIZED_DATA   = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const MEM_DISCARDABLE        = 0x0200_0000;
        const MEM_NOT_CACHED         = 0x0400_0000;
        const MEM_NOT_PAGED          = 0x0800_0000;
        const MEM_SHARED             = 0x1000_0000;
        const MEM_EXECUTE            = 0x2000_0000;
        const MEM_READ               = 0x4000_0000;
        const MEM_WRITE              = 0x8000_0000;
    }
}

impl Default for SectionCharacteristics {
    fn default() -> SectionCharacteristics {
        SectionCharacteristics::empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Section {
    /// name as stored in the header (8 bytes, NUL-trimmed).
    pub name:                String,
    /// like `name`, unless a COFF long name (`/NNN`) was resolved.
    pub display_name:        String,
    pub virtual_address:     Rva,
    pub virtual_size:        u32,
    pub pointer_to_raw_data: Raw,
    pub size_of_raw_data:    u32,
    pub characteristics:     SectionCharacteristics,
}

impl Section {
    /// A section with no raw data (e.g. `.bss`) cannot back file reads.
    pub fn is_mapped(&self) -> bool {
        !self.pointer_to_raw_data.is_null() && self.size_of_raw_data != 0
    }

    pub fn is_code(&self) -> bool {
        self.characteristics
            .contains(SectionCharacteristics::CNT_CODE | SectionCharacteristics::MEM_EXECUTE)
    }
}

/// The address mapper: parsed section geometry plus the arithmetic that
/// moves addresses among the three coordinate systems.
///
/// Conversions return the zero sentinel (`Raw::NULL` / `Va::NULL`) rather
/// than an error when an address falls outside every mapped section.
pub struct SectionMap {
    pub image_base:        Va,
    /// virtual size of the image: max section end, or `SizeOfImage`.
    pub virtual_size:      u32,
    pub size_of_headers:   u32,
    pub section_alignment: u32,
    pub file_alignment:    u32,
    pub sections:          Vec<Section>,
}

impl SectionMap {
    /// RVA span of the section as the loader maps it: the start is
    /// down-aligned to the section alignment (when that alignment is at
    /// least a page), and the span is the smaller of the aligned raw and
    /// aligned virtual sizes.
    fn span(&self, section: &Section) -> (u64, u64) {
        let start = if self.section_alignment >= 0x1000 {
            align_down(section.virtual_address.0, self.section_alignment as u64)
        } else {
            section.virtual_address.0
        };

        let virtual_size = if section.virtual_size == 0 {
            section.size_of_raw_data
        } else {
            section.virtual_size
        };

        let raw_size = if self.file_alignment >= 2 {
            align(section.size_of_raw_data as u64, self.file_alignment as u64)
        } else {
            section.size_of_raw_data as u64
        };
        let mem_size = if self.section_alignment >= 2 {
            align(virtual_size as u64, self.section_alignment as u64)
        } else {
            virtual_size as u64
        };

        (start, raw_size.min(mem_size))
    }

    /// Index of the first section (in declaration order) whose mapped
    /// span contains the RVA. Malformed images may overlap sections;
    /// the first hit wins.
    pub fn section_index_for_rva(&self, rva: Rva) -> Option<usize> {
        self.sections.iter().position(|section| {
            let (start, size) = self.span(section);
            rva.0 >= start && rva.0 < start + size
        })
    }

    pub fn section_for_rva(&self, rva: Rva) -> Option<&Section> {
        self.section_index_for_rva(rva).map(|i| &self.sections[i])
    }

    pub fn section_at_index(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|section| section.display_name == name || section.name == name)
    }

    pub fn rva_to_va(&self, rva: Rva) -> Va {
        Va(self.image_base.0 + rva.0)
    }

    pub fn va_to_rva(&self, va: Va) -> Rva {
        Rva(va.0.wrapping_sub(self.image_base.0))
    }

    pub fn rva_to_raw(&self, rva: Rva) -> Raw {
        // the headers map one-to-one.
        if rva.0 < self.size_of_headers as u64 {
            return Raw(rva.0);
        }

        if self.sections.is_empty() {
            // no sections: a single flat span up to the image size.
            if rva.0 < self.virtual_size as u64 {
                return Raw(rva.0);
            }
            return Raw::NULL;
        }

        for section in self.sections.iter() {
            if !section.is_mapped() {
                continue;
            }
            let (start, size) = self.span(section);
            if rva.0 >= start && rva.0 < start + size {
                let offset = rva.0 - start;
                if offset >= section.size_of_raw_data as u64 {
                    // inside the virtual span but past the raw data.
                    return Raw::NULL;
                }
                return section.pointer_to_raw_data + offset;
            }
        }

        Raw::NULL
    }

    pub fn raw_to_va(&self, raw: Raw) -> Va {
        if raw.0 < self.size_of_headers as u64 {
            return self.rva_to_va(Rva(raw.0));
        }

        if self.sections.is_empty() {
            if raw.0 < self.virtual_size as u64 {
                return self.rva_to_va(Rva(raw.0));
            }
            return Va::NULL;
        }

        for section in self.sections.iter() {
            if !section.is_mapped() {
                continue;
            }
            let start = section.pointer_to_raw_data.0;
            if raw.0 >= start && raw.0 < start + section.size_of_raw_data as u64 {
                let (span_start, _) = self.span(section);
                return self.rva_to_va(Rva(span_start + (raw.0 - start)));
            }
        }

        Va::NULL
    }

    pub fn va_to_raw(&self, va: Va) -> Raw {
        self.rva_to_raw(self.va_to_rva(va))
    }

    /// Clip `size` so that `va + size` does not run past the end of the
    /// containing section (or headers, or image).
    pub fn fix_addr_size(&self, va: Va, size: u64) -> u64 {
        let rva = self.va_to_rva(va);

        let end = if rva.0 < self.size_of_headers as u64 {
            self.size_of_headers as u64
        } else if let Some(section) = self.section_for_rva(rva) {
            let (start, span) = self.span(section);
            start + span
        } else {
            self.virtual_size as u64
        };

        if rva.0 >= end {
            return 0;
        }
        size.min(end - rva.0)
    }

    /// Is the RVA inside a section marked code + execute?
    pub fn is_executable_rva(&self, rva: Rva) -> bool {
        match self.section_for_rva(rva) {
            Some(section) => section.is_code(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::{aspace::ImageBuf, pe::headers, testutil};

    fn map32() -> Result<SectionMap> {
        let buf = ImageBuf::new(testutil::hello32().build());
        let nt = headers::read_nt_headers(&buf)?;
        let sections = headers::read_sections(&buf, &nt)?;
        let virtual_size = sections
            .iter()
            .map(|s| s.virtual_address.0 + s.virtual_size as u64)
            .max()
            .unwrap_or(nt.optional.SizeOfImage as u64) as u32;
        Ok(SectionMap {
            image_base: Va(nt.optional.ImageBase),
            virtual_size,
            size_of_headers: nt.optional.SizeOfHeaders,
            section_alignment: nt.optional.SectionAlignment,
            file_alignment: nt.optional.FileAlignment,
            sections,
        })
    }

    #[test]
    fn round_trips() -> Result<()> {
        let map = map32()?;

        for section in map.sections.iter() {
            let rva = section.virtual_address;
            assert_eq!(map.va_to_rva(map.rva_to_va(rva)), rva);

            let raw = map.rva_to_raw(rva);
            assert!(!raw.is_null());
            assert_eq!(map.raw_to_va(raw), map.rva_to_va(rva));
        }

        Ok(())
    }

    #[test]
    fn header_identity() -> Result<()> {
        let map = map32()?;

        assert_eq!(map.rva_to_raw(Rva(0x80)), Raw(0x80));
        assert_eq!(map.raw_to_va(Raw(0x80)), Va(0x0040_0080));

        Ok(())
    }

    #[test]
    fn unmapped_is_sentinel() -> Result<()> {
        let map = map32()?;

        // far past any section.
        assert!(map.rva_to_raw(Rva(0x10_0000)).is_null());
        assert!(map.raw_to_va(Raw(0x10_0000)).is_null());

        Ok(())
    }

    #[test]
    fn fix_addr_size_clips() -> Result<()> {
        let map = map32()?;

        // .text: raw size 0x400 < aligned virtual size, so the mapped
        // span ends at rva 0x1400.
        let va = Va(map.image_base.0 + 0x1400 - 0x10);
        assert_eq!(map.fix_addr_size(va, 0x100), 0x10);
        assert_eq!(map.fix_addr_size(va, 0x8), 0x8);

        Ok(())
    }

    #[test]
    fn executable_classification() -> Result<()> {
        let map = map32()?;

        let text = map.section_by_name(".text").unwrap();
        assert!(text.is_code());
        assert!(map.is_executable_rva(text.virtual_address));

        let rdata = map.section_by_name(".rdata").unwrap();
        assert!(!rdata.is_code());
        assert!(!map.is_executable_rva(rdata.virtual_address));

        Ok(())
    }
}
