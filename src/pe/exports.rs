// we use identifier names from the C headers for PE structures,
// which don't match the Rust style guide.
#![allow(non_snake_case)]
#![allow(non_camel_case_types)]

use std::collections::HashMap;

use anyhow::Result;
use log::{debug, warn};

use crate::{
    addr::{Raw, Rva, Va},
    apiset::{self, ApiSetSchema},
    aspace::ImageBuf,
    pe::{dirs::DirectoryAnchor, section::SectionMap},
    symbols::{SymbolKind, SymbolRecord, SymbolSink},
};

#[derive(Clone, Debug, Default)]
pub struct IMAGE_EXPORT_DIRECTORY {
    pub Name:                  u32,
    pub Base:                  u32,
    pub NumberOfFunctions:     u32,
    pub NumberOfNames:         u32,
    pub AddressOfFunctions:    u32,
    pub AddressOfNames:        u32,
    pub AddressOfNameOrdinals: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ExportEntry {
    /// empty for ordinal-only exports.
    pub function:              String,
    /// absolute ordinal (export directory base already added).
    pub ordinal:               u32,
    /// the EAT slot holding the function's RVA.
    pub export_table_va:       Va,
    pub export_table_raw:      Raw,
    pub func_rva:              Rva,
    pub func_va:               Va,
    pub func_raw:              Raw,
    /// the target lies in a code+execute section.
    /// always false for forwarded exports.
    pub executable:            bool,
    /// forward string as stored in the image, e.g. `NTDLL.RtlAllocateHeap`.
    pub original_forwarded_to: String,
    /// forward string after API-set resolution.
    pub forwarded_to:          String,
}

impl ExportEntry {
    pub fn is_forwarded(&self) -> bool {
        !self.forwarded_to.is_empty()
    }
}

#[derive(Default)]
pub struct ExportTable {
    /// the module name recorded in the export directory; the source name
    /// for API-set lookups. need not match the on-disk filename.
    pub original_name: String,
    pub entries:       Vec<ExportEntry>,
    /// name -> entry index; first writer wins on duplicate names.
    pub by_name:       HashMap<String, usize>,
    /// absolute ordinal -> entry index.
    pub by_ordinal:    HashMap<u32, usize>,
}

struct ExportScan<'a> {
    buf:          &'a ImageBuf,
    map:          &'a SectionMap,
    schema:       &'a dyn ApiSetSchema,
    sink:         &'a mut dyn SymbolSink,
    module_index: usize,
    dir_rva:      Rva,
    dir_size:     u32,
    /// the export directory's module name; consumer for API-set lookups.
    consumer:     String,
    edir:         IMAGE_EXPORT_DIRECTORY,
}

impl<'a> ExportScan<'a> {
    /// Build one entry for the function slot at `ordinal_relative`.
    /// Returns None when a pointer lands outside every mapped section,
    /// which abandons the directory.
    fn entry(&mut self, ordinal_relative: u32, function: String, func_rva: u32) -> Option<ExportEntry> {
        let slot_rva = Rva(self.edir.AddressOfFunctions as u64 + ordinal_relative as u64 * 4);
        let func_rva = Rva(func_rva as u64);

        let mut entry = ExportEntry {
            function,
            ordinal: self.edir.Base + ordinal_relative,
            export_table_va: self.map.rva_to_va(slot_rva),
            export_table_raw: self.map.rva_to_raw(slot_rva),
            func_rva,
            func_va: self.map.rva_to_va(func_rva),
            func_raw: self.map.rva_to_raw(func_rva),
            ..Default::default()
        };

        if func_rva.0 >= self.dir_rva.0 && func_rva.0 < self.dir_rva.0 + self.dir_size as u64 {
            // the "function" is a forward string inside the export directory.
            if entry.func_raw.is_null() {
                warn!("exports: forward string not mapped: {:#x}", func_rva);
                return None;
            }
            match self.buf.read_ascii(entry.func_raw) {
                Ok(forward) => {
                    entry.forwarded_to = apiset::redirect_forward(self.schema, &self.consumer, &forward);
                    entry.original_forwarded_to = forward;
                }
                Err(_) => {
                    warn!("exports: unreadable forward string at {:#x}", entry.func_raw);
                    return None;
                }
            }
        } else {
            entry.executable = self.map.is_executable_rva(func_rva);
        }

        Some(entry)
    }

    fn publish(&mut self, va: Va, kind: SymbolKind, list_index: usize) {
        if va.is_null() {
            return;
        }
        self.sink.add(SymbolRecord {
            va,
            kind,
            module_index: self.module_index,
            list_index,
            param: 0,
        });
    }
}

pub fn read_exports(
    buf: &ImageBuf,
    map: &SectionMap,
    anchor: &DirectoryAnchor,
    schema: &dyn ApiSetSchema,
    module_index: usize,
    sink: &mut dyn SymbolSink,
) -> Result<ExportTable> {
    let mut table = ExportTable::default();

    if !anchor.is_present() {
        return Ok(table);
    }

    let dir_rva = map.va_to_rva(anchor.va);
    let dir_raw = map.rva_to_raw(dir_rva);
    if dir_raw.is_null() {
        warn!("exports: directory not mapped: {:#x}", anchor.va);
        return Ok(table);
    }

    let edir = IMAGE_EXPORT_DIRECTORY {
        Name:                  buf.read_u32(dir_raw + 12)?,
        Base:                  buf.read_u32(dir_raw + 16)?,
        NumberOfFunctions:     buf.read_u32(dir_raw + 20)?,
        NumberOfNames:         buf.read_u32(dir_raw + 24)?,
        AddressOfFunctions:    buf.read_u32(dir_raw + 28)?,
        AddressOfNames:        buf.read_u32(dir_raw + 32)?,
        AddressOfNameOrdinals: buf.read_u32(dir_raw + 36)?,
    };

    debug!(
        "exports: base {} functions {} names {}",
        edir.Base, edir.NumberOfFunctions, edir.NumberOfNames
    );

    let original_name = if edir.Name != 0 {
        let raw = map.rva_to_raw(Rva(edir.Name as u64));
        if raw.is_null() {
            String::new()
        } else {
            buf.read_ascii(raw).unwrap_or_default()
        }
    } else {
        String::new()
    };

    let mut scan = ExportScan {
        buf,
        map,
        schema,
        sink,
        module_index,
        dir_rva,
        dir_size: anchor.size,
        consumer: original_name.clone(),
        edir,
    };

    table.original_name = original_name;

    if scan.edir.NumberOfFunctions == 0 {
        return Ok(table);
    }

    let functions_raw = map.rva_to_raw(Rva(scan.edir.AddressOfFunctions as u64));
    if functions_raw.is_null() {
        warn!("exports: function table not mapped");
        return Ok(table);
    }

    // scratch copy of the address table; the named pass zeroes the slots
    // it consumes, then surviving non-zero slots are ordinal-only exports.
    let mut scratch = Vec::with_capacity(scan.edir.NumberOfFunctions as usize);
    for i in 0..scan.edir.NumberOfFunctions as u64 {
        scratch.push(buf.read_u32(functions_raw + i * 4)?);
    }

    if scan.edir.NumberOfNames != 0 {
        let names_raw = map.rva_to_raw(Rva(scan.edir.AddressOfNames as u64));
        let ordinals_raw = map.rva_to_raw(Rva(scan.edir.AddressOfNameOrdinals as u64));
        if names_raw.is_null() || ordinals_raw.is_null() {
            warn!("exports: name tables not mapped");
            return Ok(table);
        }

        for i in 0..scan.edir.NumberOfNames as u64 {
            let name_rva = Rva(buf.read_u32(names_raw + i * 4)? as u64);
            let name_raw = map.rva_to_raw(name_rva);
            if name_raw.is_null() {
                warn!("exports: name {} not mapped: {:#x}", i, name_rva);
                return Ok(table);
            }
            let function = match scan.buf.read_ascii(name_raw) {
                Ok(s) => s,
                Err(_) => {
                    warn!("exports: unreadable name at {:#x}", name_raw);
                    return Ok(table);
                }
            };

            let ordinal_relative = buf.read_u16(ordinals_raw + i * 2)? as u32;
            if ordinal_relative >= scan.edir.NumberOfFunctions {
                warn!(
                    "exports: name ordinal out of range: {} >= {}",
                    ordinal_relative, scan.edir.NumberOfFunctions
                );
                continue;
            }

            let func_rva = scratch[ordinal_relative as usize];
            let entry = match scan.entry(ordinal_relative, function, func_rva) {
                Some(entry) => entry,
                None => return Ok(table),
            };

            // mark this slot handled.
            scratch[ordinal_relative as usize] = 0;

            let index = table.entries.len();
            scan.publish(entry.export_table_va, SymbolKind::EatAddress, index);
            scan.publish(
                map.rva_to_va(Rva(scan.edir.AddressOfNameOrdinals as u64 + i * 2)),
                SymbolKind::EatOrdinal,
                index,
            );
            scan.publish(
                map.rva_to_va(Rva(scan.edir.AddressOfNames as u64 + i * 4)),
                SymbolKind::EatName,
                index,
            );
            if !entry.is_forwarded() {
                scan.publish(entry.func_va, SymbolKind::Export, index);
            }

            // duplicate exported names occur in the wild (generic template
            // instantiations); the first occurrence wins.
            table.by_name.entry(entry.function.clone()).or_insert(index);
            if table.by_ordinal.insert(entry.ordinal, index).is_some() {
                warn!("exports: duplicate ordinal: {}", entry.ordinal);
            }
            table.entries.push(entry);
        }
    }

    // surviving non-zero slots are exports without names.
    for slot in 0..scan.edir.NumberOfFunctions {
        let func_rva = scratch[slot as usize];
        if func_rva == 0 {
            continue;
        }

        let entry = match scan.entry(slot, String::new(), func_rva) {
            Some(entry) => entry,
            None => return Ok(table),
        };

        let index = table.entries.len();
        scan.publish(entry.export_table_va, SymbolKind::EatAddress, index);
        if !entry.is_forwarded() {
            scan.publish(entry.func_va, SymbolKind::Export, index);
        }

        if table.by_ordinal.insert(entry.ordinal, index).is_some() {
            warn!("exports: duplicate ordinal: {}", entry.ordinal);
        }
        table.entries.push(entry);
    }

    debug!("exports: {} entries", table.entries.len());

    Ok(table)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::{
        addr::Va,
        pe::{dirs::IMAGE_DIRECTORY_ENTRY_EXPORT, Image},
        symbols::{SymbolKind, VecSink},
        testutil,
    };

    #[test]
    fn named_exports() -> Result<()> {
        let raw = testutil::export_dll64().build();
        let image = Image::from_bytes("export64.dll", raw, Va::NULL)?;

        let heap = &image.exports()[image.export_index_by_name("HeapAlloc").unwrap()];
        assert_eq!(heap.ordinal, 1);
        assert!(!heap.is_forwarded());
        assert!(heap.executable);
        assert_eq!(heap.func_va, image.map().rva_to_va(heap.func_rva));

        Ok(())
    }

    #[test]
    fn forwarded_export() -> Result<()> {
        let raw = testutil::export_dll64().build();
        let image = Image::from_bytes("export64.dll", raw, Va::NULL)?;

        let fwd = &image.exports()[image.export_index_by_name("HeapFree").unwrap()];
        assert_eq!(fwd.original_forwarded_to, "ntdll.RtlFreeHeap");
        assert_eq!(fwd.forwarded_to, "ntdll.RtlFreeHeap");
        assert!(!fwd.executable);

        // the forward string lives inside the export directory itself.
        assert_eq!(
            image.directory_index_from_rva(fwd.func_rva),
            Some(IMAGE_DIRECTORY_ENTRY_EXPORT)
        );

        Ok(())
    }

    #[test]
    fn export_table_coverage() -> Result<()> {
        let raw = testutil::export_dll64().build();
        let image = Image::from_bytes("export64.dll", raw, Va::NULL)?;

        let anchor = image.directory(IMAGE_DIRECTORY_ENTRY_EXPORT);
        for entry in image.exports() {
            assert!(entry.export_table_va.0 >= anchor.va.0);
            assert!(entry.export_table_va.0 < anchor.va.0 + anchor.size as u64);
        }

        Ok(())
    }

    #[test]
    fn ordinal_only() -> Result<()> {
        // NumberOfNames = 0, three functions, base 1.
        let raw = testutil::ordinal_dll64().build();
        let image = Image::from_bytes("mfperfhelper.dll", raw, Va::NULL)?;

        assert_eq!(image.exports().len(), 3);
        for entry in image.exports() {
            assert!(entry.function.is_empty());
        }
        let ordinals: Vec<u32> = image.exports().iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);

        assert!(image.export_index_by_name("anything").is_none());
        assert!(image.export_index_by_ordinal(1).is_some());
        assert!(image.export_index_by_ordinal(2).is_some());
        assert!(image.export_index_by_ordinal(3).is_some());

        Ok(())
    }

    #[test]
    fn publishes_eat_symbols() -> Result<()> {
        let raw = testutil::export_dll64().build();
        let mut sink = VecSink::default();
        let image = Image::from_bytes_with_sink("export64.dll", raw, Va::NULL, &mut sink)?;

        let eat = sink.of_kind(SymbolKind::EatAddress);
        assert_eq!(eat.len(), image.exports().len());

        // forwarded entries publish no Export symbol.
        let exported = sink.of_kind(SymbolKind::Export);
        let live = image.exports().iter().filter(|e| !e.is_forwarded()).count();
        assert_eq!(exported.len(), live);

        Ok(())
    }
}
