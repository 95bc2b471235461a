// we use identifier names from the C headers for PE structures,
// which don't match the Rust style guide.
// example: `IMAGE_FILE_HEADER`
// don't show compiler warnings when encountering these names.
#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use anyhow::Result;
use log::{debug, warn};
use thiserror::Error;

use crate::{
    addr::{Raw, Rva},
    aspace::ImageBuf,
    pe::section::{Section, SectionCharacteristics},
};

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("invalid DOS signature: {0:#x}")]
    InvalidDosSignature(u16),
    #[error("invalid NT signature: {0:#x}")]
    InvalidNtSignature(u32),
    #[error("unsupported machine: {0:#x}")]
    UnsupportedMachine(u16),
    #[error("unsupported optional header magic: {0:#x}")]
    UnsupportedMagic(u16),
}

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

const sizeof_IMAGE_FILE_HEADER: u64 = 0x14;
const sizeof_IMAGE_SECTION_HEADER: u64 = 0x28;
// size of one record in the COFF symbol table.
const sizeof_COFF_SYMBOL: u64 = 0x12;

#[derive(Clone, Debug, Default)]
pub struct IMAGE_FILE_HEADER {
    pub Machine:              u16,
    pub NumberOfSections:     u16,
    pub TimeDateStamp:        u32,
    pub PointerToSymbolTable: u32,
    pub NumberOfSymbols:      u32,
    pub SizeOfOptionalHeader: u16,
    pub Characteristics:      u16,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IMAGE_DATA_DIRECTORY {
    pub VirtualAddress: u32,
    pub Size:           u32,
}

/// The optional header, already widened to the PE32+ shape.
///
/// PE32 images store `ImageBase` and the stack/heap fields as u32; we
/// widen while reading so downstream code never branches on the magic.
#[derive(Clone, Debug, Default)]
pub struct IMAGE_OPTIONAL_HEADER {
    pub Magic:               u16,
    pub AddressOfEntryPoint: u32,
    pub ImageBase:           u64,
    pub SectionAlignment:    u32,
    pub FileAlignment:       u32,
    pub SizeOfImage:         u32,
    pub SizeOfHeaders:       u32,
    pub Subsystem:           u16,
    pub DllCharacteristics:  u16,
    pub NumberOfRvaAndSizes: u32,
    pub DataDirectory:       [IMAGE_DATA_DIRECTORY; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

/// DOS stub + NT signature + file header + widened optional header.
#[derive(Clone, Debug, Default)]
pub struct NtHeaders {
    /// file offset of the `PE\0\0` signature.
    pub nt_offset: Raw,
    pub file:      IMAGE_FILE_HEADER,
    pub optional:  IMAGE_OPTIONAL_HEADER,
    pub is_64:     bool,
}

impl NtHeaders {
    pub fn pointer_size(&self) -> u64 {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    pub fn bitness(&self) -> u64 {
        if self.is_64 {
            64
        } else {
            32
        }
    }

    /// file offset of the first section header.
    pub fn section_table_offset(&self) -> Raw {
        self.nt_offset + 4 + sizeof_IMAGE_FILE_HEADER + self.file.SizeOfOptionalHeader as u64
    }
}

pub fn read_nt_headers(buf: &ImageBuf) -> Result<NtHeaders> {
    let e_magic = buf.read_u16(Raw(0))?;
    if e_magic != IMAGE_DOS_SIGNATURE {
        return Err(HeaderError::InvalidDosSignature(e_magic).into());
    }

    let e_lfanew = buf.read_u32(Raw(0x3C))? as u64;
    let nt_offset = Raw(e_lfanew);

    let signature = buf.read_u32(nt_offset)?;
    if signature != IMAGE_NT_SIGNATURE {
        return Err(HeaderError::InvalidNtSignature(signature).into());
    }

    let fh = nt_offset + 4;
    let file = IMAGE_FILE_HEADER {
        Machine:              buf.read_u16(fh)?,
        NumberOfSections:     buf.read_u16(fh + 2)?,
        TimeDateStamp:        buf.read_u32(fh + 4)?,
        PointerToSymbolTable: buf.read_u32(fh + 8)?,
        NumberOfSymbols:      buf.read_u32(fh + 12)?,
        SizeOfOptionalHeader: buf.read_u16(fh + 16)?,
        Characteristics:      buf.read_u16(fh + 18)?,
    };

    let is_64 = match file.Machine {
        IMAGE_FILE_MACHINE_I386 => false,
        IMAGE_FILE_MACHINE_AMD64 => true,
        other => return Err(HeaderError::UnsupportedMachine(other).into()),
    };

    let oh = fh + sizeof_IMAGE_FILE_HEADER;
    let magic = buf.read_u16(oh)?;

    let optional = match magic {
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => IMAGE_OPTIONAL_HEADER {
            Magic:               magic,
            AddressOfEntryPoint: buf.read_u32(oh + 16)?,
            ImageBase:           buf.read_u32(oh + 28)? as u64,
            SectionAlignment:    buf.read_u32(oh + 32)?,
            FileAlignment:       buf.read_u32(oh + 36)?,
            SizeOfImage:         buf.read_u32(oh + 56)?,
            SizeOfHeaders:       buf.read_u32(oh + 60)?,
            Subsystem:           buf.read_u16(oh + 68)?,
            DllCharacteristics:  buf.read_u16(oh + 70)?,
            NumberOfRvaAndSizes: buf.read_u32(oh + 92)?,
            DataDirectory:       read_data_directories(buf, oh + 96)?,
        },
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => IMAGE_OPTIONAL_HEADER {
            Magic:               magic,
            AddressOfEntryPoint: buf.read_u32(oh + 16)?,
            ImageBase:           buf.read_u64(oh + 24)?,
            SectionAlignment:    buf.read_u32(oh + 32)?,
            FileAlignment:       buf.read_u32(oh + 36)?,
            SizeOfImage:         buf.read_u32(oh + 56)?,
            SizeOfHeaders:       buf.read_u32(oh + 60)?,
            Subsystem:           buf.read_u16(oh + 68)?,
            DllCharacteristics:  buf.read_u16(oh + 70)?,
            NumberOfRvaAndSizes: buf.read_u32(oh + 108)?,
            DataDirectory:       read_data_directories(buf, oh + 112)?,
        },
        other => return Err(HeaderError::UnsupportedMagic(other).into()),
    };

    debug!(
        "headers: machine {:#x} magic {:#x} base {:#x} sections {}",
        file.Machine, optional.Magic, optional.ImageBase, file.NumberOfSections
    );

    Ok(NtHeaders {
        nt_offset,
        file,
        optional,
        is_64,
    })
}

fn read_data_directories(
    buf: &ImageBuf,
    offset: Raw,
) -> Result<[IMAGE_DATA_DIRECTORY; IMAGE_NUMBEROF_DIRECTORY_ENTRIES]> {
    let mut dirs = [IMAGE_DATA_DIRECTORY::default(); IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
    for (i, dir) in dirs.iter_mut().enumerate() {
        let entry = offset + (i as u64) * 8;
        dir.VirtualAddress = buf.read_u32(entry)?;
        dir.Size = buf.read_u32(entry + 4)?;
    }
    Ok(dirs)
}

/// Read the section header table.
///
/// Section names that start with `/` are COFF long-name references: the
/// digits after the slash index into the COFF string table (which sits
/// right after the symbol table), and the resolved string becomes the
/// section's display name.
pub fn read_sections(buf: &ImageBuf, nt: &NtHeaders) -> Result<Vec<Section>> {
    let mut sections = Vec::with_capacity(nt.file.NumberOfSections as usize);

    let string_table =
        Raw(nt.file.PointerToSymbolTable as u64 + nt.file.NumberOfSymbols as u64 * sizeof_COFF_SYMBOL);

    for i in 0..nt.file.NumberOfSections as u64 {
        let sh = nt.section_table_offset() + i * sizeof_IMAGE_SECTION_HEADER;

        let name_bytes = buf.slice(sh, 8)?;
        let name = String::from_utf8_lossy(name_bytes)
            .trim_end_matches('\u{0}')
            .to_string();

        let mut display_name = name.clone();
        if let Some(index) = name.strip_prefix('/') {
            // COFF long name: `/NNN` is a decimal offset into the string table.
            match index.parse::<u64>() {
                Ok(offset) => match buf.read_ascii(string_table + offset) {
                    Ok(long_name) => display_name = long_name,
                    Err(_) => warn!("sections: bad long name reference: {}", name),
                },
                Err(_) => warn!("sections: bad long name index: {}", name),
            }
        }

        let section = Section {
            name,
            display_name,
            virtual_size: buf.read_u32(sh + 8)?,
            virtual_address: Rva(buf.read_u32(sh + 12)? as u64),
            size_of_raw_data: buf.read_u32(sh + 16)?,
            pointer_to_raw_data: Raw(buf.read_u32(sh + 20)? as u64),
            characteristics: SectionCharacteristics::from_bits_truncate(buf.read_u32(sh + 36)?),
        };

        debug!(
            "sections: {} rva {:#x} vsize {:#x} raw {:#x} rsize {:#x}",
            section.display_name,
            section.virtual_address,
            section.virtual_size,
            section.pointer_to_raw_data,
            section.size_of_raw_data
        );

        sections.push(section);
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::{aspace::ImageBuf, testutil};

    #[test]
    fn pe32() -> Result<()> {
        let buf = ImageBuf::new(testutil::hello32().build());
        let nt = super::read_nt_headers(&buf)?;

        assert!(!nt.is_64);
        assert_eq!(nt.optional.Magic, super::IMAGE_NT_OPTIONAL_HDR32_MAGIC);
        assert_eq!(nt.optional.ImageBase, 0x0040_0000);
        assert_eq!(nt.pointer_size(), 4);

        Ok(())
    }

    #[test]
    fn pe32_plus() -> Result<()> {
        let buf = ImageBuf::new(testutil::hello64().build());
        let nt = super::read_nt_headers(&buf)?;

        assert!(nt.is_64);
        assert_eq!(nt.optional.ImageBase, 0x1_8000_0000);
        assert_eq!(nt.pointer_size(), 8);

        Ok(())
    }

    #[test]
    fn bad_signatures() {
        let mut raw = testutil::hello32().build();
        raw[0] = b'Z';
        assert!(super::read_nt_headers(&ImageBuf::new(raw)).is_err());

        let mut raw = testutil::hello32().build();
        let e_lfanew = u32::from_le_bytes(raw[0x3C..0x40].try_into().unwrap()) as usize;
        raw[e_lfanew] = b'Q';
        assert!(super::read_nt_headers(&ImageBuf::new(raw)).is_err());
    }

    #[test]
    fn coff_long_names() -> Result<()> {
        let buf = ImageBuf::new(testutil::longname32().build());
        let nt = super::read_nt_headers(&buf)?;
        let sections = super::read_sections(&buf, &nt)?;

        let debug = sections.last().unwrap();
        assert_eq!(debug.name, "/4");
        assert_eq!(debug.display_name, ".debug_info");

        Ok(())
    }

    #[test]
    fn section_names() -> Result<()> {
        let buf = ImageBuf::new(testutil::hello32().build());
        let nt = super::read_nt_headers(&buf)?;
        let sections = super::read_sections(&buf, &nt)?;

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].display_name, ".text");
        assert_eq!(sections[1].display_name, ".rdata");
        assert_eq!(sections[2].display_name, ".reloc");

        Ok(())
    }
}
