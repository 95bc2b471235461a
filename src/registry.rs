//! The collection of parsed images, and cross-module export resolution.
use std::collections::HashMap;

use anyhow::Result;
use log::{debug, warn};

use crate::{
    addr::Va,
    apiset::{ApiSetSchema, NullSchema},
    pe::{debug::DebugReader, Image, ParseOptions},
    symbols::{NullSink, SymbolSink},
    util, Config,
};

/// forward chains in hostile images can loop; stop after this many hops.
const FORWARD_HOP_LIMIT: usize = 16;

/// What the process-inspection layer knows about a loaded module.
#[derive(Clone, Debug)]
pub struct ModuleData {
    pub image_path:    String,
    /// runtime base, or `Va::NULL` when unknown.
    pub image_base:    Va,
    pub is_base_valid: bool,
    pub is_redirected: bool,
}

/// Where an image lives: as a registry primary, or as a relocated
/// alternate attached to one.
#[derive(Copy, Clone, Debug)]
enum Location {
    Primary(usize),
    Alternate { primary: usize, alternate: usize },
}

/// Ordered collection of images.
///
/// Exactly one image per `(lowercase name, bitness)` key is the primary;
/// later duplicates become that image's relocated alternates and are
/// reachable through it (and through the base-address index).
pub struct Registry {
    images:     Vec<Image>,
    by_key:     HashMap<(String, bool), usize>,
    by_base:    HashMap<u64, Location>,
    /// module indices are assigned in add order, alternates included.
    next_index: usize,
    config:     Config,
    schema:     Box<dyn ApiSetSchema>,
    sink:       Box<dyn SymbolSink>,
    readers:    Vec<Box<dyn DebugReader>>,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry::with_collaborators(Config::default(), Box::new(NullSchema), Box::new(NullSink), vec![])
    }

    pub fn with_collaborators(
        config: Config,
        schema: Box<dyn ApiSetSchema>,
        sink: Box<dyn SymbolSink>,
        readers: Vec<Box<dyn DebugReader>>,
    ) -> Registry {
        Registry {
            images: Vec::new(),
            by_key: HashMap::new(),
            by_base: HashMap::new(),
            next_index: 0,
            config,
            schema,
            sink,
            readers,
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Parse the module's file and add the image. Returns the module
    /// index assigned to it.
    pub fn add_image(&mut self, data: &ModuleData) -> Result<usize> {
        let buf = util::read_file(&data.image_path)?;
        self.add_image_bytes(buf, data)
    }

    /// Like `add_image`, for callers that already hold the file bytes.
    pub fn add_image_bytes(&mut self, buf: Vec<u8>, data: &ModuleData) -> Result<usize> {
        let module_index = self.next_index;

        let image = Image::parse(
            &data.image_path,
            buf,
            ParseOptions {
                sections_only:    false,
                image_base:       data.image_base,
                redirected:       data.is_redirected,
                rebased_override: Some(!data.is_base_valid),
                module_index,
                config:           &self.config,
                schema:           &*self.schema,
                sink:             &mut *self.sink,
                readers:          self.readers.as_mut_slice(),
            },
        )?;

        let key = (image.image_name().to_lowercase(), image.is_64());
        let base = image.image_base();

        match self.by_key.get(&key) {
            None => {
                let index = self.images.len();
                self.by_key.insert(key, index);
                self.by_base.insert(base.0, Location::Primary(index));
                self.images.push(image);
            }
            Some(&primary) => {
                // same name and bitness at a different base: keep the
                // first image as the registry hit, stash this one on it.
                debug!(
                    "registry: relocated alternate of {}: {:#x}",
                    self.images[primary].image_name(),
                    base
                );
                let alternate = self.images[primary].relocated_alternates().len();
                self.by_base
                    .insert(base.0, Location::Alternate { primary, alternate });
                self.images[primary].push_alternate(image);
            }
        }

        self.next_index += 1;
        Ok(module_index)
    }

    fn at(&self, location: Location) -> &Image {
        match location {
            Location::Primary(index) => &self.images[index],
            Location::Alternate { primary, alternate } => {
                &self.images[primary].relocated_alternates()[alternate]
            }
        }
    }

    /// Find the module at (or owning) the given address.
    ///
    /// Base-address equality is O(1); with `check_ownership`, falls back
    /// to scanning every image's span.
    pub fn get_module(&self, va: Va, check_ownership: bool) -> Option<&Image> {
        if let Some(&location) = self.by_base.get(&va.0) {
            return Some(self.at(location));
        }

        if !check_ownership {
            return None;
        }

        self.images
            .iter()
            .flat_map(|image| std::iter::once(image).chain(image.relocated_alternates()))
            .find(|image| image.image_base().0 < va.0 && va.0 < image.image_base().0 + image.virtual_size() as u64)
    }

    /// Primary image for a library name (file basename, case folded).
    /// Forward targets usually come without an extension; retry with
    /// `.dll` appended.
    fn get_library(&self, library: &str, is_64: bool) -> Option<&Image> {
        let name = library
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(library)
            .to_lowercase();

        if let Some(&index) = self.by_key.get(&(name.clone(), is_64)) {
            return Some(&self.images[index]);
        }
        self.by_key
            .get(&(format!("{}.dll", name), is_64))
            .map(|&index| &self.images[index])
    }

    /// Raw export lookup: no forward resolution.
    ///
    /// Among the primary and its alternates, prefer the image whose span
    /// contains `check_va` (callers pass an address known to belong to
    /// the instance they mean); otherwise the primary answers.
    fn lookup_proc(&self, library: &str, proc: &str, is_64: bool, check_va: Va) -> Option<(&Image, usize)> {
        let primary = self.get_library(library, is_64)?;

        let image = if check_va.is_null() {
            primary
        } else {
            primary.image_at_va(check_va)
        };

        // a decimal "name", optionally prefixed with `#`, is an ordinal.
        let numeric = proc.strip_prefix('#').unwrap_or(proc);
        let index = if !numeric.is_empty() && numeric.bytes().all(|b| b.is_ascii_digit()) {
            image.export_index_by_ordinal(numeric.parse().ok()?)
        } else {
            image.export_index_by_name(proc)
        }?;

        Some((image, index))
    }

    /// Look up an export, resolving forwards across modules.
    pub fn get_proc_data(&self, library: &str, proc: &str, is_64: bool, check_va: Va) -> Option<(&Image, usize)> {
        let (image, index) = self.lookup_proc(library, proc, is_64, check_va)?;

        let entry = &image.exports()[index];
        if entry.forwarded_to.is_empty() {
            return Some((image, index));
        }
        self.resolve_forward(&entry.forwarded_to, is_64, check_va)
    }

    /// Resolve a forward string (`"library.function"`) to the entry that
    /// finally implements it. Chains are followed (`USP10.X` -> `GDI32.X`
    /// -> `gdi32full.X`) up to a fixed hop limit.
    pub fn resolve_forward(&self, forward: &str, is_64: bool, check_va: Va) -> Option<(&Image, usize)> {
        let mut current = forward.to_string();

        for _ in 0..FORWARD_HOP_LIMIT {
            // the function name is the part after the *last* dot; the
            // library portion may itself contain dots.
            let (library, function) = current.rsplit_once('.')?;
            let (image, index) = self.lookup_proc(library, function, is_64, check_va)?;

            let entry = &image.exports()[index];
            if entry.forwarded_to.is_empty() {
                return Some((image, index));
            }
            current = entry.forwarded_to.clone();
        }

        warn!("registry: forward chain too deep: {}", forward);
        None
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::testutil;

    fn module(path: &str, base: Va) -> ModuleData {
        ModuleData {
            image_path:    path.to_string(),
            image_base:    base,
            is_base_valid: true,
            is_redirected: false,
        }
    }

    #[test]
    fn forward_chain_across_modules() -> Result<()> {
        let mut registry = Registry::new();

        // a.dll exports N -> b.M; b.dll exports M -> c.M; c.dll owns M.
        registry.add_image_bytes(
            testutil::forwarder_dll64("a.dll", "N", "b.M").build(),
            &module("a.dll", Va(0x1_8000_0000)),
        )?;
        registry.add_image_bytes(
            testutil::forwarder_dll64("b.dll", "M", "c.M").build(),
            &module("b.dll", Va(0x1_8010_0000)),
        )?;
        registry.add_image_bytes(
            testutil::exporting_dll64("c.dll", "M").build(),
            &module("c.dll", Va(0x1_8020_0000)),
        )?;

        let (image, index) = registry.get_proc_data("a.dll", "N", true, Va::NULL).unwrap();
        assert_eq!(image.image_name(), "c.dll");
        let entry = &image.exports()[index];
        assert_eq!(entry.function, "M");
        assert!(entry.forwarded_to.is_empty());

        Ok(())
    }

    #[test]
    fn forward_chain_through_apiset() -> Result<()> {
        // kernel32 forwards GetModuleFileNameW into an API-set contract;
        // the schema maps the contract onto kernelbase, which owns the
        // implementation.
        let schema = testutil::MapSchema::with(&[(
            "api-ms-win-core-libraryloader-l1-1-0",
            "kernelbase.dll",
        )]);
        let mut registry = Registry::with_collaborators(
            Config::default(),
            Box::new(schema),
            Box::new(NullSink),
            vec![],
        );

        registry.add_image_bytes(
            testutil::forwarder_dll64(
                "kernel32.dll",
                "GetModuleFileNameW",
                "api-ms-win-core-libraryloader-l1-1-0.GetModuleFileNameW",
            )
            .build(),
            &module("kernel32.dll", Va(0x1_8000_0000)),
        )?;
        registry.add_image_bytes(
            testutil::exporting_dll64("kernelbase.dll", "GetModuleFileNameW").build(),
            &module("kernelbase.dll", Va(0x1_8010_0000)),
        )?;

        // the export parser already rewrote the forward string.
        let k32 = registry.get_module(Va(0x1_8000_0000), false).unwrap();
        assert_eq!(k32.exports()[0].forwarded_to, "kernelbase.GetModuleFileNameW");

        let (image, index) = registry
            .get_proc_data("kernel32.dll", "GetModuleFileNameW", true, Va::NULL)
            .unwrap();
        assert_eq!(image.image_name(), "kernelbase.dll");
        assert!(image.exports()[index].forwarded_to.is_empty());

        Ok(())
    }

    #[test]
    fn forward_cycle_is_broken() -> Result<()> {
        let mut registry = Registry::new();

        // x.dll: P -> y.P; y.dll: P -> x.P. hostile loop.
        registry.add_image_bytes(
            testutil::forwarder_dll64("x.dll", "P", "y.P").build(),
            &module("x.dll", Va(0x1_8000_0000)),
        )?;
        registry.add_image_bytes(
            testutil::forwarder_dll64("y.dll", "P", "x.P").build(),
            &module("y.dll", Va(0x1_8010_0000)),
        )?;

        assert!(registry.get_proc_data("x.dll", "P", true, Va::NULL).is_none());

        Ok(())
    }

    #[test]
    fn lookup_by_ordinal_string() -> Result<()> {
        let mut registry = Registry::new();
        registry.add_image_bytes(
            testutil::ordinal_dll64().build(),
            &module("mfperfhelper.dll", Va(0x1_8000_0000)),
        )?;

        assert!(registry.get_proc_data("mfperfhelper.dll", "#2", true, Va::NULL).is_some());
        assert!(registry.get_proc_data("mfperfhelper.dll", "3", true, Va::NULL).is_some());
        assert!(registry.get_proc_data("mfperfhelper.dll", "#9", true, Va::NULL).is_none());

        Ok(())
    }

    #[test]
    fn relocated_alternates() -> Result<()> {
        let mut registry = Registry::new();

        registry.add_image_bytes(
            testutil::exporting_dll64("dup.dll", "Fn").build(),
            &module("dup.dll", Va(0x1_8000_0000)),
        )?;
        registry.add_image_bytes(
            testutil::exporting_dll64("dup.dll", "Fn").build(),
            &module("dup.dll", Va(0x1_9000_0000)),
        )?;

        // one registry hit; the duplicate hangs off the primary.
        assert_eq!(registry.len(), 1);
        let primary = &registry.images()[0];
        assert_eq!(primary.relocated_alternates().len(), 1);
        assert_eq!(primary.image_base(), Va(0x1_8000_0000));

        let va_in_alternate = Va(0x1_9000_1000);
        let hit = primary.image_at_va(va_in_alternate);
        assert_eq!(hit.image_base(), Va(0x1_9000_0000));

        // the base index reaches the alternate directly.
        let by_base = registry.get_module(Va(0x1_9000_0000), false).unwrap();
        assert_eq!(by_base.image_base(), Va(0x1_9000_0000));

        // ownership scan finds the alternate for interior addresses.
        let owner = registry.get_module(va_in_alternate, true).unwrap();
        assert_eq!(owner.image_base(), Va(0x1_9000_0000));

        Ok(())
    }

    #[test]
    fn module_indices_count_alternates() -> Result<()> {
        let mut registry = Registry::new();

        let first = registry.add_image_bytes(
            testutil::exporting_dll64("dup.dll", "Fn").build(),
            &module("dup.dll", Va(0x1_8000_0000)),
        )?;
        let second = registry.add_image_bytes(
            testutil::exporting_dll64("dup.dll", "Fn").build(),
            &module("dup.dll", Va(0x1_9000_0000)),
        )?;
        let third = registry.add_image_bytes(
            testutil::exporting_dll64("other.dll", "Fn").build(),
            &module("other.dll", Va(0x1_A000_0000)),
        )?;

        assert_eq!((first, second, third), (0, 1, 2));

        Ok(())
    }
}
