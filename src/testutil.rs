//! Synthetic PE images for tests and doctests.
//!
//! Real fixtures are inconvenient to ship, and the interesting corners
//! (forward chains, VA-form delay descriptors, mid-block ABSOLUTE
//! relocations) are rare in benign binaries anyway. These builders emit
//! minimal but well-formed PE32/PE32+ files with a fixed three-section
//! layout:
//!
//! ```text
//!   headers   raw 0x000..0x400
//!   .text     rva 0x1000  raw 0x0400  (code)
//!   .rdata    rva 0x2000  raw 0x0800  (directories, tables, strings)
//!   .reloc    rva 0x3000  raw 0x1000  (base relocations)
//! ```
use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::apiset::ApiSetSchema;
use crate::pe::dirs;

const SIZEOF_FILE: usize = 0x1200;

const TEXT_RVA: u32 = 0x1000;
const TEXT_RAW: u32 = 0x400;
const RDATA_RVA: u32 = 0x2000;
const RDATA_RAW: u32 = 0x800;
const RELOC_RVA: u32 = 0x3000;
const RELOC_RAW: u32 = 0x1000;

const CODE: u32 = 0x6000_0020; // CNT_CODE | MEM_EXECUTE | MEM_READ
const RDATA: u32 = 0x4000_0040; // CNT_INITIALIZED_DATA | MEM_READ
const RELOC: u32 = 0x4200_0040; // + MEM_DISCARDABLE

struct SectionSpec {
    name:            String,
    virtual_address: u32,
    virtual_size:    u32,
    raw_pointer:     u32,
    raw_size:        u32,
    characteristics: u32,
}

pub struct PeBuilder {
    is_64:          bool,
    image_base:     u64,
    entry_point:    u32,
    symbol_table:   (u32, u32),
    directories:    [(u32, u32); dirs::DIRECTORY_COUNT],
    sections:       Vec<SectionSpec>,
    patches:        Vec<(usize, Vec<u8>)>,
}

impl PeBuilder {
    fn new(is_64: bool, image_base: u64) -> PeBuilder {
        PeBuilder {
            is_64,
            image_base,
            entry_point: 0,
            symbol_table: (0, 0),
            directories: [(0, 0); dirs::DIRECTORY_COUNT],
            sections: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// PE32 with the standard three-section layout.
    pub fn pe32(image_base: u64) -> PeBuilder {
        let mut b = PeBuilder::new(false, image_base);
        b.standard_sections();
        b
    }

    /// PE32+ with the standard three-section layout.
    pub fn pe64(image_base: u64) -> PeBuilder {
        let mut b = PeBuilder::new(true, image_base);
        b.standard_sections();
        b
    }

    fn standard_sections(&mut self) {
        self.section(".text", TEXT_RVA, 0x1000, TEXT_RAW, 0x400, CODE);
        self.section(".rdata", RDATA_RVA, 0x1000, RDATA_RAW, 0x800, RDATA);
        self.section(".reloc", RELOC_RVA, 0x1000, RELOC_RAW, 0x200, RELOC);
    }

    pub fn section(
        &mut self,
        name: &str,
        virtual_address: u32,
        virtual_size: u32,
        raw_pointer: u32,
        raw_size: u32,
        characteristics: u32,
    ) -> &mut PeBuilder {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            virtual_address,
            virtual_size,
            raw_pointer,
            raw_size,
            characteristics,
        });
        self
    }

    pub fn entry(&mut self, rva: u32) -> &mut PeBuilder {
        self.entry_point = rva;
        self
    }

    pub fn symbol_table(&mut self, pointer: u32, count: u32) -> &mut PeBuilder {
        self.symbol_table = (pointer, count);
        self
    }

    pub fn dir(&mut self, index: usize, rva: u32, size: u32) -> &mut PeBuilder {
        self.directories[index] = (rva, size);
        self
    }

    /// file offset backing an RVA, per the declared sections.
    pub fn raw_for(&self, rva: u32) -> usize {
        for section in self.sections.iter() {
            if rva >= section.virtual_address && rva < section.virtual_address + section.virtual_size {
                return (rva - section.virtual_address + section.raw_pointer) as usize;
            }
        }
        panic!("rva not covered by any section: {:#x}", rva);
    }

    pub fn write(&mut self, raw: usize, bytes: &[u8]) -> &mut PeBuilder {
        self.patches.push((raw, bytes.to_vec()));
        self
    }

    pub fn write_u16(&mut self, raw: usize, v: u16) -> &mut PeBuilder {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.write(raw, &b)
    }

    pub fn write_u32(&mut self, raw: usize, v: u32) -> &mut PeBuilder {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.write(raw, &b)
    }

    pub fn write_u64(&mut self, raw: usize, v: u64) -> &mut PeBuilder {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.write(raw, &b)
    }

    /// write a pointer-sized value at the builder's bitness.
    pub fn write_ptr(&mut self, raw: usize, v: u64) -> &mut PeBuilder {
        if self.is_64 {
            self.write_u64(raw, v)
        } else {
            self.write_u32(raw, v as u32)
        }
    }

    /// write a NUL-terminated ASCII string.
    pub fn write_str(&mut self, raw: usize, s: &str) -> &mut PeBuilder {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.write(raw, &bytes)
    }

    /// convenience: write at an RVA instead of a file offset.
    pub fn write_u32_rva(&mut self, rva: u32, v: u32) -> &mut PeBuilder {
        let raw = self.raw_for(rva);
        self.write_u32(raw, v)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SIZEOF_FILE];

        // DOS header.
        buf[0] = b'M';
        buf[1] = b'Z';
        let e_lfanew = 0x80u32;
        LittleEndian::write_u32(&mut buf[0x3C..0x40], e_lfanew);

        // NT signature.
        let nt = e_lfanew as usize;
        buf[nt..nt + 4].copy_from_slice(b"PE\0\0");

        // IMAGE_FILE_HEADER.
        let fh = nt + 4;
        let (machine, opt_size) = if self.is_64 {
            (0x8664u16, 0xF0u16)
        } else {
            (0x014Cu16, 0xE0u16)
        };
        LittleEndian::write_u16(&mut buf[fh..fh + 2], machine);
        LittleEndian::write_u16(&mut buf[fh + 2..fh + 4], self.sections.len() as u16);
        LittleEndian::write_u32(&mut buf[fh + 8..fh + 12], self.symbol_table.0);
        LittleEndian::write_u32(&mut buf[fh + 12..fh + 16], self.symbol_table.1);
        LittleEndian::write_u16(&mut buf[fh + 16..fh + 18], opt_size);
        LittleEndian::write_u16(&mut buf[fh + 18..fh + 20], 0x0102);

        // optional header, PE32 or PE32+.
        let oh = fh + 0x14;
        let magic = if self.is_64 { 0x20Bu16 } else { 0x10Bu16 };
        LittleEndian::write_u16(&mut buf[oh..oh + 2], magic);
        LittleEndian::write_u32(&mut buf[oh + 16..oh + 20], self.entry_point);
        if self.is_64 {
            LittleEndian::write_u64(&mut buf[oh + 24..oh + 32], self.image_base);
        } else {
            LittleEndian::write_u32(&mut buf[oh + 28..oh + 32], self.image_base as u32);
        }
        LittleEndian::write_u32(&mut buf[oh + 32..oh + 36], 0x1000); // SectionAlignment
        LittleEndian::write_u32(&mut buf[oh + 36..oh + 40], 0x200); // FileAlignment

        let size_of_image = self
            .sections
            .iter()
            .map(|s| s.virtual_address + s.virtual_size)
            .max()
            .unwrap_or(0x1000);
        LittleEndian::write_u32(&mut buf[oh + 56..oh + 60], size_of_image);
        LittleEndian::write_u32(&mut buf[oh + 60..oh + 64], 0x400); // SizeOfHeaders
        LittleEndian::write_u16(&mut buf[oh + 68..oh + 70], 3); // Subsystem: console

        let (rva_count_at, dirs_at) = if self.is_64 {
            (oh + 108, oh + 112)
        } else {
            (oh + 92, oh + 96)
        };
        LittleEndian::write_u32(
            &mut buf[rva_count_at..rva_count_at + 4],
            dirs::DIRECTORY_COUNT as u32,
        );
        for (i, (rva, size)) in self.directories.iter().enumerate() {
            let at = dirs_at + i * 8;
            LittleEndian::write_u32(&mut buf[at..at + 4], *rva);
            LittleEndian::write_u32(&mut buf[at + 4..at + 8], *size);
        }

        // section headers.
        let mut sh = oh + opt_size as usize;
        for section in self.sections.iter() {
            let name = section.name.as_bytes();
            buf[sh..sh + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            LittleEndian::write_u32(&mut buf[sh + 8..sh + 12], section.virtual_size);
            LittleEndian::write_u32(&mut buf[sh + 12..sh + 16], section.virtual_address);
            LittleEndian::write_u32(&mut buf[sh + 16..sh + 20], section.raw_size);
            LittleEndian::write_u32(&mut buf[sh + 20..sh + 24], section.raw_pointer);
            LittleEndian::write_u32(&mut buf[sh + 36..sh + 40], section.characteristics);
            sh += 0x28;
        }

        for (offset, bytes) in self.patches.iter() {
            buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        }

        buf
    }
}

/// Enable log output during a test run: `RUST_LOG=debug cargo test`.
#[cfg(test)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// API-set schema backed by a map, for tests.
pub struct MapSchema {
    pub map: HashMap<String, String>,
}

impl MapSchema {
    pub fn with(entries: &[(&str, &str)]) -> MapSchema {
        MapSchema {
            map: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ApiSetSchema for MapSchema {
    fn resolve(&self, _consumer: &str, provider: &str) -> Option<String> {
        self.map.get(provider).cloned()
    }
}

/// Plain PE32 executable, preferred base 0x00400000, entry at .text.
pub fn hello32() -> PeBuilder {
    let mut b = PeBuilder::pe32(0x0040_0000);
    b.entry(0x1000);
    let text = b.raw_for(TEXT_RVA);
    b.write(text, &[0xB8, 0x00, 0x00, 0x00, 0x00, 0xC3]); // mov eax, 0; ret
    let msg = b.raw_for(RDATA_RVA);
    b.write_str(msg, "hello from a tiny image");
    b
}

/// Plain PE32+ executable, preferred base 0x180000000.
pub fn hello64() -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.entry(0x1000);
    let text = b.raw_for(TEXT_RVA);
    b.write(text, &[0x33, 0xC0, 0xC3]); // xor eax, eax; ret
    b
}

/// PE32+ DLL exporting `HeapAlloc` (code at rva 0x1010, ordinal 1) and
/// `HeapFree` (forwarded to `ntdll.RtlFreeHeap`, ordinal 2). The export
/// directory records the module name `export64.dll`.
pub fn export_dll64() -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_EXPORT, 0x2000, 0x100);

    let d = b.raw_for(0x2000);
    b.write_u32(d + 12, 0x2080); // Name
    b.write_u32(d + 16, 1); // Base
    b.write_u32(d + 20, 2); // NumberOfFunctions
    b.write_u32(d + 24, 2); // NumberOfNames
    b.write_u32(d + 28, 0x2028); // AddressOfFunctions
    b.write_u32(d + 32, 0x2030); // AddressOfNames
    b.write_u32(d + 36, 0x2038); // AddressOfNameOrdinals

    // address table: code, then a forward string inside the directory.
    b.write_u32_rva(0x2028, 0x1010);
    b.write_u32_rva(0x202C, 0x2040);
    // name pointers.
    b.write_u32_rva(0x2030, 0x2060);
    b.write_u32_rva(0x2034, 0x2070);
    // name ordinals.
    b.write_u16(b.raw_for(0x2038), 0);
    b.write_u16(b.raw_for(0x203A), 1);

    b.write_str(b.raw_for(0x2040), "ntdll.RtlFreeHeap");
    b.write_str(b.raw_for(0x2060), "HeapAlloc");
    b.write_str(b.raw_for(0x2070), "HeapFree");
    b.write_str(b.raw_for(0x2080), "export64.dll");

    let text = b.raw_for(0x1010);
    b.write(text, &[0xC3]);
    b
}

/// PE32+ DLL with three ordinal-only exports: `NumberOfNames = 0`,
/// `NumberOfFunctions = 3`, ordinal base 1.
pub fn ordinal_dll64() -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_EXPORT, 0x2000, 0x100);

    let d = b.raw_for(0x2000);
    b.write_u32(d + 12, 0x2080); // Name
    b.write_u32(d + 16, 1); // Base
    b.write_u32(d + 20, 3); // NumberOfFunctions
    b.write_u32(d + 24, 0); // NumberOfNames
    b.write_u32(d + 28, 0x2028); // AddressOfFunctions

    b.write_u32_rva(0x2028, 0x1010);
    b.write_u32_rva(0x202C, 0x1020);
    b.write_u32_rva(0x2030, 0x1030);

    b.write_str(b.raw_for(0x2080), "mfperfhelper.dll");
    b
}

/// PE32+ DLL whose export directory names it `name` and exports a single
/// symbol forwarded to `target` (a `library.function` string).
pub fn forwarder_dll64(name: &str, export: &str, target: &str) -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_EXPORT, 0x2000, 0x100);

    let d = b.raw_for(0x2000);
    b.write_u32(d + 12, 0x20E0); // Name
    b.write_u32(d + 16, 1); // Base
    b.write_u32(d + 20, 1); // NumberOfFunctions
    b.write_u32(d + 24, 1); // NumberOfNames
    b.write_u32(d + 28, 0x2028);
    b.write_u32(d + 32, 0x2030);
    b.write_u32(d + 36, 0x2038);

    b.write_u32_rva(0x2028, 0x2040); // forward string, inside the directory
    b.write_u32_rva(0x2030, 0x20C0);
    b.write_u16(b.raw_for(0x2038), 0);

    b.write_str(b.raw_for(0x2040), target);
    b.write_str(b.raw_for(0x20C0), export);
    b.write_str(b.raw_for(0x20E0), name);
    b
}

/// PE32+ DLL exporting one real (code) symbol.
pub fn exporting_dll64(name: &str, export: &str) -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_EXPORT, 0x2000, 0x100);

    let d = b.raw_for(0x2000);
    b.write_u32(d + 12, 0x2080);
    b.write_u32(d + 16, 1);
    b.write_u32(d + 20, 1);
    b.write_u32(d + 24, 1);
    b.write_u32(d + 28, 0x2028);
    b.write_u32(d + 32, 0x2030);
    b.write_u32(d + 36, 0x2038);

    b.write_u32_rva(0x2028, 0x1010);
    b.write_u32_rva(0x2030, 0x2060);
    b.write_u16(b.raw_for(0x2038), 0);

    b.write_str(b.raw_for(0x2060), export);
    b.write_str(b.raw_for(0x2080), name);

    let text = b.raw_for(0x1010);
    b.write(text, &[0xC3]);
    b
}

/// PE32 executable importing from kernel32.dll by name
/// (`ExitProcess`, `GetModuleHandleA`) and by ordinal (#17).
pub fn import_exe32() -> PeBuilder {
    let mut b = PeBuilder::pe32(0x0040_0000);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_IMPORT, 0x2000, 0x28);

    let d = b.raw_for(0x2000);
    b.write_u32(d, 0x2040); // OriginalFirstThunk
    b.write_u32(d + 12, 0x2090); // Name
    b.write_u32(d + 16, 0x2060); // FirstThunk
    // the all-zero terminator descriptor follows implicitly.

    // INT and IAT are parallel.
    for table in [0x2040u32, 0x2060] {
        b.write_u32_rva(table, 0x20A0);
        b.write_u32_rva(table + 4, 0x20B0);
        b.write_u32_rva(table + 8, 0x8000_0011); // ordinal 17
        b.write_u32_rva(table + 12, 0);
    }

    b.write_str(b.raw_for(0x2090), "kernel32.dll");
    b.write_u16(b.raw_for(0x20A0), 0);
    b.write_str(b.raw_for(0x20A2), "ExitProcess");
    b.write_u16(b.raw_for(0x20B0), 1);
    b.write_str(b.raw_for(0x20B2), "GetModuleHandleA");
    b
}

/// PE32+ executable importing `GetModuleFileNameW` from an API-set
/// contract name.
pub fn import_exe64_apiset() -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_IMPORT, 0x2000, 0x28);

    let d = b.raw_for(0x2000);
    b.write_u32(d, 0x2040);
    b.write_u32(d + 12, 0x2090);
    b.write_u32(d + 16, 0x2060);

    for table in [0x2040u32, 0x2060] {
        let raw = b.raw_for(table);
        b.write_u64(raw, 0x20C0);
        b.write_u64(raw + 8, 0);
    }

    b.write_str(b.raw_for(0x2090), "api-ms-win-core-libraryloader-l1-1-0.dll");
    b.write_u16(b.raw_for(0x20C0), 0);
    b.write_str(b.raw_for(0x20C2), "GetModuleFileNameW");
    b
}

/// PE32+ with one delay-import descriptor in the modern (RVA) form,
/// importing `user32.dll!MessageBoxW`. The pre-init IAT slot holds the
/// VA of a jump stub at rva 0x1040.
pub fn delay_exe64() -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT, 0x2200, 0x40);

    let d = b.raw_for(0x2200);
    b.write_u32(d, 1); // grAttrs: RVA form
    b.write_u32(d + 4, 0x2300); // rvaDLLName
    b.write_u32(d + 8, 0x2310); // rvaHmod
    b.write_u32(d + 12, 0x2320); // rvaIAT
    b.write_u32(d + 16, 0x2340); // rvaINT

    b.write_str(b.raw_for(0x2300), "user32.dll");

    let iat = b.raw_for(0x2320);
    b.write_u64(iat, 0x1_8000_1040);
    let int = b.raw_for(0x2340);
    b.write_u64(int, 0x2360);

    b.write_u16(b.raw_for(0x2360), 0);
    b.write_str(b.raw_for(0x2362), "MessageBoxW");
    b
}

/// PE32 with a delay descriptor in the legacy VA form (`grAttrs = 0`):
/// every descriptor field holds a VA based at the preferred base
/// 0x10000000, and the parser must subtract the base before mapping.
pub fn delay_exe32_va_form() -> PeBuilder {
    let base = 0x1000_0000u64;
    let mut b = PeBuilder::pe32(base);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT, 0x2200, 0x40);

    let d = b.raw_for(0x2200);
    b.write_u32(d, 0); // grAttrs: VA form
    b.write_u32(d + 4, (base + 0x2300) as u32);
    b.write_u32(d + 8, (base + 0x2310) as u32);
    b.write_u32(d + 12, (base + 0x2100) as u32);
    b.write_u32(d + 16, (base + 0x2340) as u32);

    b.write_str(b.raw_for(0x2300), "user32.dll");

    b.write_u32_rva(0x2100, 0x1000_1040);
    b.write_u32_rva(0x2340, 0x2360);

    b.write_u16(b.raw_for(0x2360), 0);
    b.write_str(b.raw_for(0x2362), "MessageBoxW");
    b
}

/// PE32 with one relocation block: HIGHLOW, ABSOLUTE (mid-block!),
/// HIGHLOW. Targets hold absolute pointers into .text and .rdata.
pub fn reloc_exe32() -> PeBuilder {
    let mut b = PeBuilder::pe32(0x0040_0000);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_BASERELOC, RELOC_RVA, 0x10);

    let block = b.raw_for(RELOC_RVA);
    b.write_u32(block, 0x1000); // page rva
    b.write_u32(block + 4, 8 + 3 * 2); // SizeOfBlock
    b.write_u16(block + 8, (3 << 12) | 0x010); // HIGHLOW @ 0x1010
    b.write_u16(block + 10, 0); // ABSOLUTE padding, mid-block
    b.write_u16(block + 12, (3 << 12) | 0x020); // HIGHLOW @ 0x1020

    b.write_u32_rva(0x1010, 0x0040_1234);
    b.write_u32_rva(0x1020, 0x0040_2000);
    b
}

/// PE32+ with an entry point and two TLS callbacks. DIR64 relocations
/// cover the `AddressOfCallBacks` field and both callback slots so the
/// chain stays valid when the image is rebased.
pub fn tls_exe64() -> PeBuilder {
    let base = 0x1_8000_0000u64;
    let mut b = PeBuilder::pe64(base);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_TLS, 0x2400, 0x28);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_BASERELOC, RELOC_RVA, 0x10);

    // three pointer-sized fields, then AddressOfCallBacks.
    let tls = b.raw_for(0x2400);
    b.write_u64(tls + 24, base + 0x2500);

    let callbacks = b.raw_for(0x2500);
    b.write_u64(callbacks, base + 0x1100);
    b.write_u64(callbacks + 8, base + 0x1200);

    let block = b.raw_for(RELOC_RVA);
    b.write_u32(block, 0x2000);
    b.write_u32(block + 4, 8 + 4 * 2);
    b.write_u16(block + 8, (10 << 12) | 0x418); // AddressOfCallBacks
    b.write_u16(block + 10, (10 << 12) | 0x500); // callback 0
    b.write_u16(block + 12, (10 << 12) | 0x508); // callback 1
    b.write_u16(block + 14, 0); // ABSOLUTE padding
    b
}

/// PE32 with a `/4` long-named section resolved through the COFF string
/// table.
pub fn longname32() -> PeBuilder {
    let mut b = PeBuilder::pe32(0x0040_0000);
    b.entry(0x1000);
    b.section("/4", 0x4000, 0x100, 0, 0, RDATA);
    // string table right after the (empty) symbol table.
    b.symbol_table(0x1180, 0);
    b.write_u32(0x1180, 0x10); // table size
    b.write_str(0x1184, ".debug_info");
    b
}

/// PE32+ with a COM+ (CLR) header marked IL-only.
pub fn clr_exe64() -> PeBuilder {
    let mut b = PeBuilder::pe64(0x1_8000_0000);
    b.entry(0x1000);
    b.dir(dirs::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR, 0x2600, 0x48);

    let d = b.raw_for(0x2600);
    b.write_u32(d, 0x48); // cb
    b.write_u32(d + 0x10, 0x1); // Flags: ILONLY
    b
}
