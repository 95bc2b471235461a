// we use identifier names from the C headers for PE structures,
// which don't match the Rust style guide.
// example: `IMAGE_IMPORT_DESCRIPTOR`
// don't show compiler warnings when encountering these names.
#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use anyhow::Result;
use log::{debug, warn};

use crate::{
    addr::{Rva, Va},
    apiset::{self, ApiSetSchema},
    aspace::ImageBuf,
    pe::{dirs::DirectoryAnchor, section::SectionMap},
    symbols::{SymbolKind, SymbolRecord, SymbolSink},
};

const sizeof_IMAGE_IMPORT_DESCRIPTOR: u64 = 0x14;
const sizeof_ImgDelayDescr: u64 = 0x20;
const sizeof_IMAGE_BOUND_IMPORT_DESCRIPTOR: u64 = 0x8;

// ```
//  0x0                    0x14
//  +-------------------------+           0x0          ptrsize
//  | IMAGE_IMPORT_DESCRIPTOR | --------> +------------------+
//  +-------------------------+ \         | IMAGE_THUNK_DATA | -------> +----------------------+
//  | ...                     |  |        +------------------+          | IMAGE_IMPORT_BY_NAME |
//  +-------------------------+  |        | ...              |          +----------------------+
//  | 00 00 00 00 00 00 00    |  |        +------------------+          | hint u16             |
//  +-------------------------+  |        | 00 00 00 00 00   |          | name ascii           |
//                               |        +------------------+          +----------------------+
//                               |
//                               +> dll-name (ascii)
// ```
#[derive(Clone)]
pub struct IMAGE_IMPORT_DESCRIPTOR {
    pub OriginalFirstThunk: Rva,
    pub TimeDateStamp:      u32,
    pub ForwarderChain:     u32,
    pub Name:               Rva,
    pub FirstThunk:         Rva,
}

impl std::fmt::Debug for IMAGE_IMPORT_DESCRIPTOR {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "IMAGE_IMPORT_DESCRIPTOR(FT: {:#x} OFT: {:#x} name: {:#x})",
            self.FirstThunk, self.OriginalFirstThunk, self.Name
        )
    }
}

/// Delay-load descriptor. All fields are u32 on disk; whether they hold
/// RVAs or (pre-Win2k toolchain) VAs is governed by `grAttrs` bit 0.
#[derive(Clone, Debug)]
pub struct ImgDelayDescr {
    pub grAttrs:    u32,
    pub rvaDLLName: u32,
    pub rvaHmod:    u32,
    pub rvaIAT:     u32,
    pub rvaINT:     u32,
}

/// One imported function, standard or delayed.
#[derive(Clone, Debug, Default)]
pub struct ImportEntry {
    pub delayed:          bool,
    /// library name as stored in the descriptor.
    pub original_library: String,
    /// library name after API-set resolution.
    pub library:          String,
    /// empty when the import is by ordinal.
    pub function:         String,
    /// hint for named imports, ordinal for ordinal imports.
    pub ordinal:          u32,
    /// the IAT slot the loader will patch.
    pub import_table_va:  Va,
    /// delay imports: where the loader stores the module handle.
    pub delayed_module_instance_va: Va,
    /// delay imports: the pre-initialization IAT value
    /// (helper-thunk address, correct only after relocation).
    pub delayed_iat_data: u64,
}

fn ordinal_mask(is_64: bool) -> u64 {
    if is_64 {
        1u64 << 63
    } else {
        1u64 << 31
    }
}

/// Walk the standard import descriptors.
///
/// Walks the INT for names when present; bound images can carry runtime
/// VAs in the on-disk IAT, so the IAT is only a fallback.
#[allow(clippy::too_many_arguments)]
pub fn read_imports(
    buf: &ImageBuf,
    map: &SectionMap,
    anchor: &DirectoryAnchor,
    is_64: bool,
    schema: &dyn ApiSetSchema,
    image_name: &str,
    module_index: usize,
    sink: &mut dyn SymbolSink,
    entries: &mut Vec<ImportEntry>,
) -> Result<()> {
    if !anchor.is_present() {
        return Ok(());
    }

    let dir_rva = map.va_to_rva(anchor.va);
    let psize = if is_64 { 8u64 } else { 4u64 };

    for i in 0.. {
        let desc_rva = Rva(dir_rva.0 + i * sizeof_IMAGE_IMPORT_DESCRIPTOR);
        let desc_raw = map.rva_to_raw(desc_rva);
        if desc_raw.is_null() {
            warn!("imports: descriptor {} not mapped", i);
            return Ok(());
        }

        let descriptor = IMAGE_IMPORT_DESCRIPTOR {
            OriginalFirstThunk: Rva(buf.read_u32(desc_raw)? as u64),
            TimeDateStamp:      buf.read_u32(desc_raw + 4)?,
            ForwarderChain:     buf.read_u32(desc_raw + 8)?,
            Name:               Rva(buf.read_u32(desc_raw + 12)? as u64),
            FirstThunk:         Rva(buf.read_u32(desc_raw + 16)? as u64),
        };

        if descriptor.OriginalFirstThunk.is_zero() {
            break;
        }

        sink.add(SymbolRecord {
            va:           map.rva_to_va(desc_rva),
            kind:         SymbolKind::ImportDescriptor,
            module_index,
            list_index:   entries.len(),
            param:        0,
        });

        let name_raw = map.rva_to_raw(descriptor.Name);
        if name_raw.is_null() {
            warn!("imports: {:?}: name not mapped", descriptor);
            return Ok(());
        }
        let original_library = match buf.read_ascii(name_raw) {
            Ok(s) => s,
            Err(_) => {
                warn!("imports: {:?}: unreadable name", descriptor);
                return Ok(());
            }
        };
        let library = apiset::redirect_library(schema, image_name, &original_library);

        debug!("imports: {:?} -> {}", descriptor, library);

        // prefer the INT: on disk the IAT of a bound image holds
        // addresses, not name pointers.
        let int_rva = if !descriptor.OriginalFirstThunk.is_zero() {
            descriptor.OriginalFirstThunk
        } else {
            descriptor.FirstThunk
        };

        for j in 0.. {
            let int_slot = Rva(int_rva.0 + j * psize);
            let int_raw = map.rva_to_raw(int_slot);
            if int_raw.is_null() {
                warn!("imports: {}: thunk table not mapped", original_library);
                return Ok(());
            }

            let thunk = buf.read_pointer(is_64, int_raw)?;
            if thunk == 0 {
                break;
            }

            let iat_slot = Rva(descriptor.FirstThunk.0 + j * psize);

            let mut entry = ImportEntry {
                original_library: original_library.clone(),
                library: library.clone(),
                import_table_va: map.rva_to_va(iat_slot),
                ..Default::default()
            };

            if thunk & ordinal_mask(is_64) != 0 {
                // MSB set: import by ordinal.
                entry.ordinal = (thunk & 0xFFFF) as u32;
            } else {
                let hn_raw = map.rva_to_raw(Rva(thunk));
                if hn_raw.is_null() {
                    warn!("imports: {}: hint/name not mapped: {:#x}", original_library, thunk);
                    return Ok(());
                }
                entry.ordinal = buf.read_u16(hn_raw)? as u32;
                entry.function = match buf.read_ascii(hn_raw + 2) {
                    Ok(s) => s,
                    Err(_) => {
                        warn!("imports: {}: unreadable hint/name", original_library);
                        return Ok(());
                    }
                };
            }

            let index = entries.len();
            sink.add(SymbolRecord {
                va:           entry.import_table_va,
                kind:         SymbolKind::ImportTable,
                module_index,
                list_index:   index,
                param:        if is_64 { 64 } else { 32 },
            });
            sink.add(SymbolRecord {
                va:           map.rva_to_va(int_slot),
                kind:         SymbolKind::ImportNameTable,
                module_index,
                list_index:   index,
                param:        if is_64 { 64 } else { 32 },
            });

            entries.push(entry);
        }
    }

    Ok(())
}

/// Walk the delay-load descriptors.
///
/// Must run after relocations have been applied: on 64-bit images the
/// pre-initialization IAT values are absolute pointers.
#[allow(clippy::too_many_arguments)]
pub fn read_delay_imports(
    buf: &ImageBuf,
    map: &SectionMap,
    anchor: &DirectoryAnchor,
    is_64: bool,
    preferred_base: u64,
    schema: &dyn ApiSetSchema,
    image_name: &str,
    module_index: usize,
    sink: &mut dyn SymbolSink,
    entries: &mut Vec<ImportEntry>,
) -> Result<()> {
    if !anchor.is_present() {
        return Ok(());
    }

    let dir_rva = map.va_to_rva(anchor.va);
    let psize = if is_64 { 8u64 } else { 4u64 };

    for i in 0.. {
        let desc_raw = map.rva_to_raw(Rva(dir_rva.0 + i * sizeof_ImgDelayDescr));
        if desc_raw.is_null() {
            warn!("delay imports: descriptor {} not mapped", i);
            return Ok(());
        }

        let descriptor = ImgDelayDescr {
            grAttrs:    buf.read_u32(desc_raw)?,
            rvaDLLName: buf.read_u32(desc_raw + 4)?,
            rvaHmod:    buf.read_u32(desc_raw + 8)?,
            rvaIAT:     buf.read_u32(desc_raw + 12)?,
            rvaINT:     buf.read_u32(desc_raw + 16)?,
        };

        if descriptor.rvaIAT == 0 {
            break;
        }

        // attribute bit 0 set: fields are RVAs (dloadsup).
        // clear: the old format stored VAs relative to the preferred base.
        let get_rva = |field: u32| -> Rva {
            if descriptor.grAttrs & 1 != 0 {
                Rva(field as u64)
            } else {
                Rva((field as u64).wrapping_sub(preferred_base))
            }
        };

        let name_raw = map.rva_to_raw(get_rva(descriptor.rvaDLLName));
        if name_raw.is_null() {
            warn!("delay imports: descriptor {}: name not mapped", i);
            return Ok(());
        }
        let original_library = match buf.read_ascii(name_raw) {
            Ok(s) => s,
            Err(_) => {
                warn!("delay imports: descriptor {}: unreadable name", i);
                return Ok(());
            }
        };
        let library = apiset::redirect_library(schema, image_name, &original_library);

        debug!("delay imports: {:?} -> {}", descriptor, library);

        let instance_va = if descriptor.rvaHmod != 0 {
            map.rva_to_va(get_rva(descriptor.rvaHmod))
        } else {
            Va::NULL
        };

        let int_rva = get_rva(descriptor.rvaINT);
        let iat_rva = get_rva(descriptor.rvaIAT);

        for j in 0.. {
            let int_slot = Rva(int_rva.0 + j * psize);
            let int_raw = map.rva_to_raw(int_slot);
            if int_raw.is_null() {
                warn!("delay imports: {}: thunk table not mapped", original_library);
                return Ok(());
            }

            let thunk = buf.read_pointer(is_64, int_raw)?;
            if thunk == 0 {
                break;
            }

            let iat_slot = Rva(iat_rva.0 + j * psize);
            let iat_raw = map.rva_to_raw(iat_slot);
            if iat_raw.is_null() {
                warn!("delay imports: {}: IAT not mapped", original_library);
                return Ok(());
            }

            let mut entry = ImportEntry {
                delayed: true,
                original_library: original_library.clone(),
                library: library.clone(),
                import_table_va: map.rva_to_va(iat_slot),
                delayed_module_instance_va: instance_va,
                // helper-thunk pointer as patched by the relocation pass.
                delayed_iat_data: buf.read_pointer(is_64, iat_raw)?,
                ..Default::default()
            };

            if thunk & ordinal_mask(is_64) != 0 {
                entry.ordinal = (thunk & 0xFFFF) as u32;
            } else {
                let hn_raw = map.rva_to_raw(Rva(thunk));
                if hn_raw.is_null() {
                    warn!(
                        "delay imports: {}: hint/name not mapped: {:#x}",
                        original_library, thunk
                    );
                    return Ok(());
                }
                entry.ordinal = buf.read_u16(hn_raw)? as u32;
                entry.function = match buf.read_ascii(hn_raw + 2) {
                    Ok(s) => s,
                    Err(_) => {
                        warn!("delay imports: {}: unreadable hint/name", original_library);
                        return Ok(());
                    }
                };
            }

            let index = entries.len();
            sink.add(SymbolRecord {
                va:           entry.import_table_va,
                kind:         SymbolKind::DelayImportTable,
                module_index,
                list_index:   index,
                param:        if is_64 { 64 } else { 32 },
            });
            sink.add(SymbolRecord {
                va:           map.rva_to_va(int_slot),
                kind:         SymbolKind::DelayImportNameTable,
                module_index,
                list_index:   index,
                param:        if is_64 { 64 } else { 32 },
            });

            entries.push(entry);
        }
    }

    Ok(())
}

/// Tag the bound-import descriptors and their forwarder refs.
/// These contribute symbols only; the IAT entries they pre-resolve are
/// already covered by the standard import walk.
pub fn read_bound_imports(
    buf: &ImageBuf,
    map: &SectionMap,
    anchor: &DirectoryAnchor,
    module_index: usize,
    sink: &mut dyn SymbolSink,
) -> Result<()> {
    if !anchor.is_present() {
        return Ok(());
    }

    let dir_rva = map.va_to_rva(anchor.va);

    let mut index = 0u64;
    let mut list_index = 0usize;
    loop {
        let record_rva = Rva(dir_rva.0 + index * sizeof_IMAGE_BOUND_IMPORT_DESCRIPTOR);
        let record_raw = map.rva_to_raw(record_rva);
        if record_raw.is_null() {
            warn!("bound imports: record {} not mapped", index);
            return Ok(());
        }

        let TimeDateStamp = buf.read_u32(record_raw)?;
        let OffsetModuleName = buf.read_u16(record_raw + 4)?;
        let NumberOfModuleForwarderRefs = buf.read_u16(record_raw + 6)?;

        if TimeDateStamp == 0 && OffsetModuleName == 0 {
            break;
        }

        sink.add(SymbolRecord {
            va: map.rva_to_va(record_rva),
            kind: SymbolKind::BoundImportDescriptor,
            module_index,
            list_index,
            param: 0,
        });
        list_index += 1;
        index += 1;

        for _ in 0..NumberOfModuleForwarderRefs {
            let forward_rva = Rva(dir_rva.0 + index * sizeof_IMAGE_BOUND_IMPORT_DESCRIPTOR);
            if map.rva_to_raw(forward_rva).is_null() {
                warn!("bound imports: forwarder ref not mapped");
                return Ok(());
            }
            sink.add(SymbolRecord {
                va: map.rva_to_va(forward_rva),
                kind: SymbolKind::BoundImportForwardRef,
                module_index,
                list_index,
                param: 0,
            });
            list_index += 1;
            index += 1;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::{
        addr::Va,
        pe::Image,
        symbols::{SymbolKind, VecSink},
        testutil,
    };

    #[test]
    fn named_and_ordinal_imports() -> Result<()> {
        let raw = testutil::import_exe32().build();
        let image = Image::from_bytes("import32.exe", raw, Va::NULL)?;

        let named: Vec<_> = image.imports().iter().filter(|i| !i.function.is_empty()).collect();
        assert_eq!(named.len(), 2);
        assert_eq!(named[0].library, "kernel32.dll");
        assert_eq!(named[0].function, "ExitProcess");
        assert_eq!(named[1].function, "GetModuleHandleA");

        let by_ordinal: Vec<_> = image.imports().iter().filter(|i| i.function.is_empty()).collect();
        assert_eq!(by_ordinal.len(), 1);
        assert_eq!(by_ordinal[0].ordinal, 17);

        for entry in image.imports() {
            assert!(!entry.delayed);
            assert!(!entry.import_table_va.is_null());
        }

        Ok(())
    }

    #[test]
    fn import_symbols_published() -> Result<()> {
        let raw = testutil::import_exe32().build();
        let mut sink = VecSink::default();
        let image = Image::from_bytes_with_sink("import32.exe", raw, Va::NULL, &mut sink)?;

        assert_eq!(sink.of_kind(SymbolKind::ImportDescriptor).len(), 1);
        assert_eq!(sink.of_kind(SymbolKind::ImportTable).len(), image.imports().len());
        assert_eq!(
            sink.of_kind(SymbolKind::ImportNameTable).len(),
            image.imports().len()
        );

        Ok(())
    }

    #[test]
    fn apiset_redirects_library_names() -> Result<()> {
        use crate::{
            pe::ParseOptions,
            symbols::NullSink,
            testutil::MapSchema,
            Config, Va,
        };

        let schema = MapSchema::with(&[("api-ms-win-core-libraryloader-l1-1-0", "kernelbase.dll")]);
        let mut sink = NullSink;
        let image = Image::parse(
            "consumer64.exe",
            testutil::import_exe64_apiset().build(),
            ParseOptions {
                sections_only: false,
                image_base: Va::NULL,
                redirected: false,
                rebased_override: None,
                module_index: 0,
                config: &Config::default(),
                schema: &schema,
                sink: &mut sink,
                readers: &mut [],
            },
        )?;

        let entry = &image.imports()[0];
        assert_eq!(entry.original_library, "api-ms-win-core-libraryloader-l1-1-0.dll");
        assert_eq!(entry.library, "kernelbase.dll");
        assert_eq!(entry.function, "GetModuleFileNameW");

        Ok(())
    }

    #[test]
    fn delay_imports_rva_form() -> Result<()> {
        let raw = testutil::delay_exe64().build();
        let image = Image::from_bytes("delay64.dll", raw, Va::NULL)?;

        let delayed: Vec<_> = image.imports().iter().filter(|i| i.delayed).collect();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].library, "user32.dll");
        assert_eq!(delayed[0].function, "MessageBoxW");
        assert!(!delayed[0].delayed_module_instance_va.is_null());
        // pre-init IAT value points at the jump stub in .text.
        assert_eq!(delayed[0].delayed_iat_data, 0x1_8000_1040);

        Ok(())
    }

    #[test]
    fn delay_imports_va_form() -> Result<()> {
        // grAttrs = 0: descriptor fields are VAs based at the preferred base.
        let raw = testutil::delay_exe32_va_form().build();
        let image = Image::from_bytes("delay32.dll", raw, Va::NULL)?;

        let delayed: Vec<_> = image.imports().iter().filter(|i| i.delayed).collect();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].function, "MessageBoxW");
        // ImportTableVA = image_base + (FirstThunk_field - preferred_base)
        assert_eq!(delayed[0].import_table_va, Va(0x1000_0000 + 0x2100));

        Ok(())
    }
}
