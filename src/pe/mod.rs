//! A parsed PE image.
//!
//! `Image` owns the on-disk bytes and everything recovered from them:
//! sections, directories, export/import/relocation/TLS tables, entry
//! points, string literals. Construction runs the whole pipeline in a
//! fixed order; afterwards the image is read-only (the registry may
//! append relocated alternates).
use std::path::Path;

use anyhow::Result;
use log::{debug, warn};

pub mod debug;
pub mod dirs;
pub mod exports;
pub mod headers;
pub mod imports;
pub mod reloc;
pub mod section;
pub mod strings;
pub mod tls;

use crate::{
    addr::{Raw, Rva, Va},
    apiset::{ApiSetSchema, NullSchema},
    aspace::ImageBuf,
    symbols::{NullSink, SymbolKind, SymbolRecord, SymbolSink},
    util, Config,
};
use self::debug::{DebugData, DebugReader};
use self::dirs::{DirectoryAnchor, DIRECTORY_COUNT};
use self::exports::{ExportEntry, ExportTable};
use self::headers::NtHeaders;
use self::imports::ImportEntry;
use self::reloc::RelocationData;
use self::section::{Section, SectionMap};
use self::strings::StringLiteral;

const IMAGE_COR20_FLAG_ILONLY: u32 = 0x1;
const IMAGE_COR20_FLAG_32BITREQUIRED: u32 = 0x2;

/// An address of interest for execution: the image entry point, or a TLS
/// callback (`"Tls Callback N"`).
#[derive(Clone, Debug)]
pub struct EntryPoint {
    pub name: String,
    pub raw:  Raw,
    pub va:   Va,
}

/// Everything the parse pipeline needs besides the bytes.
pub struct ParseOptions<'a> {
    pub sections_only:    bool,
    /// runtime base, or `Va::NULL` to adopt the header's preferred base.
    pub image_base:       Va,
    pub redirected:       bool,
    /// when absent, rebased = (base != preferred base).
    pub rebased_override: Option<bool>,
    pub module_index:     usize,
    pub config:           &'a Config,
    pub schema:           &'a dyn ApiSetSchema,
    pub sink:             &'a mut dyn SymbolSink,
    pub readers:          &'a mut [Box<dyn DebugReader>],
}

impl<'a> ParseOptions<'a> {
    fn publish(&mut self, va: Va, kind: SymbolKind, list_index: usize, param: u64) {
        if va.is_null() {
            return;
        }
        self.sink.add(SymbolRecord {
            va,
            kind,
            module_index: self.module_index,
            list_index,
            param,
        });
    }
}

pub struct Image {
    path:             String,
    name:             String,
    buf:              ImageBuf,
    nt:               NtHeaders,
    map:              SectionMap,
    preferred_base:   Va,
    rebased:          bool,
    redirected:       bool,
    file_size:        u64,
    dirs:             [DirectoryAnchor; DIRECTORY_COUNT],
    export_table:     ExportTable,
    imports:          Vec<ImportEntry>,
    entry_points:     Vec<EntryPoint>,
    relocations:      RelocationData,
    relocation_delta: i64,
    strings:          Vec<StringLiteral>,
    com_plus_il_only: bool,
    debug_data:       DebugData,
    debug_link:       Option<std::path::PathBuf>,
    module_index:     usize,
    /// later images with the same name and bitness, loaded at other bases.
    alternates:       Vec<Image>,
}

impl Image {
    /// Analyze the file at `path`, assuming the OS loader mapped it at
    /// `image_base` (or at its preferred base when `Va::NULL`).
    pub fn from_path(path: &str, sections_only: bool, image_base: Va) -> Result<Image> {
        let buf = util::read_file(path)?;
        let mut sink = NullSink;
        Image::parse(
            path,
            buf,
            ParseOptions {
                sections_only,
                image_base,
                redirected: false,
                rebased_override: None,
                module_index: 0,
                config: &Config::default(),
                schema: &NullSchema,
                sink: &mut sink,
                readers: &mut [],
            },
        )
    }

    /// Partial parse used for `.gnu_debuglink` companion files: headers
    /// and sections only.
    pub fn from_path_sections_only(path: &str) -> Result<Image> {
        Image::from_path(path, true, Va::NULL)
    }

    /// Construct from what the process-inspection layer knows about a
    /// loaded module. An invalid base marks the image rebased.
    pub fn from_module(data: &crate::registry::ModuleData, module_index: usize) -> Result<Image> {
        let buf = util::read_file(&data.image_path)?;
        let mut sink = NullSink;
        Image::parse(
            &data.image_path,
            buf,
            ParseOptions {
                sections_only: false,
                image_base: data.image_base,
                redirected: data.is_redirected,
                rebased_override: Some(!data.is_base_valid),
                module_index,
                config: &Config::default(),
                schema: &NullSchema,
                sink: &mut sink,
                readers: &mut [],
            },
        )
    }

    pub fn from_bytes(name: &str, buf: Vec<u8>, image_base: Va) -> Result<Image> {
        let mut sink = NullSink;
        Image::from_bytes_with_sink(name, buf, image_base, &mut sink)
    }

    pub fn from_bytes_with_sink(
        name: &str,
        buf: Vec<u8>,
        image_base: Va,
        sink: &mut dyn SymbolSink,
    ) -> Result<Image> {
        Image::parse(
            name,
            buf,
            ParseOptions {
                sections_only: false,
                image_base,
                redirected: false,
                rebased_override: None,
                module_index: 0,
                config: &Config::default(),
                schema: &NullSchema,
                sink,
                readers: &mut [],
            },
        )
    }

    /// The full pipeline. Directory parsers are partial-tolerant: a
    /// corrupt directory is logged and abandoned without failing the
    /// image. Only an unreadable file or bad DOS/NT signatures are fatal.
    pub fn parse(path: &str, buf: Vec<u8>, mut opts: ParseOptions<'_>) -> Result<Image> {
        let buf = ImageBuf::new(buf);
        let file_size = buf.len();

        let nt = headers::read_nt_headers(&buf)?;
        let sections = headers::read_sections(&buf, &nt)?;

        let preferred_base = Va(nt.optional.ImageBase);
        let image_base = if opts.image_base.is_null() {
            preferred_base
        } else {
            opts.image_base
        };
        let rebased = opts
            .rebased_override
            .unwrap_or(image_base != preferred_base);

        // the loaded span covers the furthest section end, not the
        // header's SizeOfImage, which lies in some packed samples.
        let virtual_size = sections
            .iter()
            .map(|s| s.virtual_address.0 + s.virtual_size as u64)
            .max()
            .unwrap_or(nt.optional.SizeOfImage as u64) as u32;

        let map = SectionMap {
            image_base,
            virtual_size,
            size_of_headers: nt.optional.SizeOfHeaders,
            section_alignment: nt.optional.SectionAlignment,
            file_alignment: nt.optional.FileAlignment,
            sections,
        };

        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());

        debug!(
            "image: {} base {:#x} (preferred {:#x}) vsize {:#x}",
            name, image_base, preferred_base, virtual_size
        );

        let mut image = Image {
            path: path.to_string(),
            name,
            buf,
            nt,
            map,
            preferred_base,
            rebased,
            redirected: opts.redirected,
            file_size,
            dirs: [DirectoryAnchor::default(); DIRECTORY_COUNT],
            export_table: ExportTable::default(),
            imports: Vec::new(),
            entry_points: Vec::new(),
            relocations: RelocationData::default(),
            relocation_delta: 0,
            strings: Vec::new(),
            com_plus_il_only: false,
            debug_data: DebugData::empty(),
            debug_link: None,
            module_index: opts.module_index,
            alternates: Vec::new(),
        };

        if opts.sections_only {
            return Ok(image);
        }

        image.dirs = dirs::materialize(&image.nt, &image.map);

        let bitness = image.nt.bitness();
        opts.publish(image.map.image_base, SymbolKind::InstanceBase, 0, bitness);
        opts.publish(
            image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_EXPORT].va,
            SymbolKind::ExportDirectory,
            0,
            0,
        );
        opts.publish(
            image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_TLS].va,
            SymbolKind::TlsDirectory,
            0,
            bitness,
        );
        opts.publish(
            image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG].va,
            SymbolKind::LoadConfigDirectory,
            0,
            bitness,
        );

        image.export_table = exports::read_exports(
            &image.buf,
            &image.map,
            &image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_EXPORT],
            opts.schema,
            opts.module_index,
            opts.sink,
        )?;

        imports::read_imports(
            &image.buf,
            &image.map,
            &image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_IMPORT],
            image.nt.is_64,
            opts.schema,
            &image.name,
            opts.module_index,
            opts.sink,
            &mut image.imports,
        )?;

        // parse and apply relocations before anything that reads
        // absolute pointers out of the image (delay-import IATs, TLS
        // callback chains).
        image.relocations = reloc::read_relocations(
            &image.buf,
            &image.map,
            &image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_BASERELOC],
        )?;
        for (index, block) in image.relocations.blocks.iter().enumerate() {
            opts.publish(block.page_va, SymbolKind::RelocationBlock, index, 0);
        }
        image.relocation_delta = {
            let delta = (image.map.image_base.0).wrapping_sub(preferred_base.0) as i64;
            if image.nt.is_64 {
                delta
            } else {
                // PE32 slots are 32 bits wide; so is the delta.
                (delta as i32) as i64
            }
        };
        reloc::apply_relocations(
            &mut image.buf,
            &image.relocations,
            image.nt.is_64,
            image.relocation_delta,
        )?;

        imports::read_delay_imports(
            &image.buf,
            &image.map,
            &image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT],
            image.nt.is_64,
            preferred_base.0,
            opts.schema,
            &image.name,
            opts.module_index,
            opts.sink,
            &mut image.imports,
        )?;

        imports::read_bound_imports(
            &image.buf,
            &image.map,
            &image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_BOUND_IMPORT],
            opts.module_index,
            opts.sink,
        )?;

        if image.nt.optional.AddressOfEntryPoint != 0 {
            let rva = Rva(image.nt.optional.AddressOfEntryPoint as u64);
            let entry = EntryPoint {
                name: "EntryPoint".to_string(),
                raw:  image.map.rva_to_raw(rva),
                va:   image.map.rva_to_va(rva),
            };
            opts.publish(entry.va, SymbolKind::EntryPoint, image.entry_points.len(), 0);
            image.entry_points.push(entry);
        }

        for (n, callback) in tls::read_tls_callbacks(
            &image.buf,
            &image.map,
            &image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_TLS],
            image.nt.is_64,
        )?
        .into_iter()
        .enumerate()
        {
            let entry = EntryPoint {
                name: format!("Tls Callback {}", n),
                raw:  image.map.va_to_raw(callback),
                va:   callback,
            };
            let index = image.entry_points.len();
            opts.publish(entry.va, SymbolKind::TlsCallback, index, 0);
            opts.publish(entry.va, SymbolKind::EntryPoint, index, 0);
            image.entry_points.push(entry);
        }

        let com = &image.dirs[dirs::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR];
        if com.is_present() {
            let raw = image.map.va_to_raw(com.va);
            if raw.is_null() {
                warn!("com+: header not mapped: {:#x}", com.va);
            } else {
                let flags = image.buf.read_u32(raw + 0x10)?;
                image.com_plus_il_only =
                    flags & (IMAGE_COR20_FLAG_ILONLY | IMAGE_COR20_FLAG_32BITREQUIRED) != 0;
            }
        }

        if opts.config.load_strings {
            image.strings =
                strings::scan_strings(&image.buf, &image.map, opts.config.string_min_length);
            for (index, literal) in image.strings.iter().enumerate() {
                if !literal.va.is_null() {
                    opts.publish(literal.va, SymbolKind::StringData, index, 0);
                }
            }
        }

        let (flavors, link) = debug::load_debug_info(&image, opts.readers);
        image.debug_data = flavors;
        image.debug_link = link;

        Ok(image)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn image_name(&self) -> &str {
        &self.name
    }

    /// the module name recorded in the export directory.
    pub fn original_name(&self) -> &str {
        &self.export_table.original_name
    }

    pub fn is_64(&self) -> bool {
        self.nt.is_64
    }

    pub fn image_base(&self) -> Va {
        self.map.image_base
    }

    pub fn preferred_base(&self) -> Va {
        self.preferred_base
    }

    pub fn rebased(&self) -> bool {
        self.rebased
    }

    pub fn redirected(&self) -> bool {
        self.redirected
    }

    pub fn virtual_size(&self) -> u32 {
        self.map.virtual_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn com_plus_il_only(&self) -> bool {
        self.com_plus_il_only
    }

    pub fn debug_data(&self) -> DebugData {
        self.debug_data
    }

    pub fn debug_link(&self) -> Option<&std::path::Path> {
        self.debug_link.as_deref()
    }

    pub fn module_index(&self) -> usize {
        self.module_index
    }

    pub fn nt_headers(&self) -> &NtHeaders {
        &self.nt
    }

    pub fn map(&self) -> &SectionMap {
        &self.map
    }

    pub fn buf(&self) -> &ImageBuf {
        &self.buf
    }

    pub fn file_data(&self) -> &[u8] {
        self.buf.data()
    }

    /// read a pointer-sized value at a raw offset, widened to u64.
    pub fn read_pointer(&self, raw: Raw) -> Result<u64> {
        self.buf.read_pointer(self.nt.is_64, raw)
    }

    pub fn directory(&self, index: usize) -> DirectoryAnchor {
        self.dirs[index]
    }

    pub fn directories(&self) -> &[DirectoryAnchor; DIRECTORY_COUNT] {
        &self.dirs
    }

    pub fn directory_index_from_rva(&self, rva: Rva) -> Option<usize> {
        dirs::directory_index_from_rva(&self.dirs, &self.map, rva)
    }

    pub fn exports(&self) -> &[ExportEntry] {
        &self.export_table.entries
    }

    pub fn export_index_by_name(&self, name: &str) -> Option<usize> {
        self.export_table.by_name.get(name).copied()
    }

    pub fn export_index_by_ordinal(&self, ordinal: u32) -> Option<usize> {
        self.export_table.by_ordinal.get(&ordinal).copied()
    }

    pub fn imports(&self) -> &[ImportEntry] {
        &self.imports
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn relocation_data(&self) -> &RelocationData {
        &self.relocations
    }

    /// the flat list of RAW offsets the relocation pass patches;
    /// `None` entries are ABSOLUTE padding holes.
    pub fn relocations(&self) -> &[Option<Raw>] {
        &self.relocations.offsets
    }

    /// runtime base minus preferred base, as applied to the image.
    pub fn relocation_delta(&self) -> i64 {
        self.relocation_delta
    }

    pub fn strings(&self) -> &[StringLiteral] {
        &self.strings
    }

    // address mapper surface.

    pub fn rva_to_raw(&self, rva: Rva) -> Raw {
        self.map.rva_to_raw(rva)
    }

    pub fn raw_to_va(&self, raw: Raw) -> Va {
        self.map.raw_to_va(raw)
    }

    pub fn rva_to_va(&self, rva: Rva) -> Va {
        self.map.rva_to_va(rva)
    }

    pub fn va_to_rva(&self, va: Va) -> Rva {
        self.map.va_to_rva(va)
    }

    pub fn va_to_raw(&self, va: Va) -> Raw {
        self.map.va_to_raw(va)
    }

    pub fn fix_addr_size(&self, va: Va, size: u64) -> u64 {
        self.map.fix_addr_size(va, size)
    }

    pub fn section_at_index(&self, index: usize) -> Option<&Section> {
        self.map.section_at_index(index)
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.map.section_by_name(name)
    }

    pub fn section_for_va(&self, va: Va) -> Option<&Section> {
        self.map.section_for_rva(self.map.va_to_rva(va))
    }

    /// does `[image_base, image_base + virtual_size)` contain the VA?
    pub fn contains_va(&self, va: Va) -> bool {
        va.0 >= self.map.image_base.0 && va.0 < self.map.image_base.0 + self.map.virtual_size as u64
    }

    /// relocated copies of this module registered after it.
    pub fn relocated_alternates(&self) -> &[Image] {
        &self.alternates
    }

    pub(crate) fn push_alternate(&mut self, alternate: Image) {
        self.alternates.push(alternate);
    }

    /// this image, or the relocated alternate whose span contains `va`.
    pub fn image_at_va(&self, va: Va) -> &Image {
        if self.contains_va(va) {
            return self;
        }
        self.alternates
            .iter()
            .find(|alt| alt.contains_va(va))
            .unwrap_or(self)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::testutil;

    #[test]
    fn hello32_at_preferred_base() -> Result<()> {
        let raw = testutil::hello32().build();
        let image = Image::from_bytes("hello.exe", raw, Va(0x0040_0000))?;

        assert!(!image.is_64());
        assert!(!image.rebased());
        assert_eq!(image.relocation_delta(), 0);
        assert_eq!(image.image_base(), Va(0x0040_0000));
        assert_eq!(image.entry_points()[0].name, "EntryPoint");

        Ok(())
    }

    #[test]
    fn accessor_vas_stay_in_image() -> Result<()> {
        let raw = testutil::export_dll64().build();
        let image = Image::from_bytes("export64.dll", raw, Va(0x1_8004_0000))?;

        let base = image.image_base();
        let end = base + image.virtual_size() as u64;

        for entry in image.exports() {
            assert!(entry.export_table_va.0 >= base.0 && entry.export_table_va.0 < end.0);
            assert!(entry.func_va.0 >= base.0 && entry.func_va.0 < end.0);
        }
        for entry in image.imports() {
            assert!(entry.import_table_va.0 >= base.0 && entry.import_table_va.0 < end.0);
        }
        for entry in image.entry_points() {
            assert!(entry.va.0 >= base.0 && entry.va.0 < end.0);
        }

        Ok(())
    }

    #[test]
    fn original_name_from_export_directory() -> Result<()> {
        let raw = testutil::export_dll64().build();
        let image = Image::from_bytes("renamed_on_disk.dll", raw, Va::NULL)?;

        assert_eq!(image.image_name(), "renamed_on_disk.dll");
        assert_eq!(image.original_name(), "export64.dll");

        Ok(())
    }

    #[test]
    fn sections_only_stops_early() -> Result<()> {
        let raw = testutil::export_dll64().build();
        let mut sink = crate::symbols::VecSink::default();
        let image = Image::parse(
            "export64.dll",
            raw,
            ParseOptions {
                sections_only: true,
                image_base: Va::NULL,
                redirected: false,
                rebased_override: None,
                module_index: 0,
                config: &Config::default(),
                schema: &crate::apiset::NullSchema,
                sink: &mut sink,
                readers: &mut [],
            },
        )?;

        assert!(!image.map().sections.is_empty());
        assert!(image.exports().is_empty());
        assert!(image.imports().is_empty());
        assert!(sink.records.is_empty());

        Ok(())
    }

    #[test]
    fn com_plus_il_only() -> Result<()> {
        let raw = testutil::clr_exe64().build();
        let image = Image::from_bytes("managed.dll", raw, Va::NULL)?;
        assert!(image.com_plus_il_only());

        let raw = testutil::hello64().build();
        let image = Image::from_bytes("native.exe", raw, Va::NULL)?;
        assert!(!image.com_plus_il_only());

        Ok(())
    }

    #[test]
    fn strings_can_be_disabled() -> Result<()> {
        let raw = testutil::hello32().build();
        let mut sink = NullSink;
        let image = Image::parse(
            "hello.exe",
            raw,
            ParseOptions {
                sections_only: false,
                image_base: Va::NULL,
                redirected: false,
                rebased_override: None,
                module_index: 0,
                config: &Config {
                    load_strings: false,
                    string_min_length: 4,
                },
                schema: &NullSchema,
                sink: &mut sink,
                readers: &mut [],
            },
        )?;

        assert!(image.strings().is_empty());

        Ok(())
    }
}
