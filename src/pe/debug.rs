//! The image gate: the narrow view of an image that debug-info parsers
//! are allowed to see, optionally retargeted to a `.gnu_debuglink`
//! companion file.
use std::path::{Path, PathBuf};

use anyhow::Result;
use bitflags::bitflags;
use log::{debug, warn};

use crate::{
    addr::{Raw, Va},
    pe::{section::Section, Image},
    util,
};

bitflags! {
    /// Which debug-info flavors were found in an image.
    pub struct DebugData: u8 {
        const COFF  = 0b0000_0001;
        const DWARF = 0b0000_0010;
    }
}

impl Default for DebugData {
    fn default() -> DebugData {
        DebugData::empty()
    }
}

/// The capabilities a debug-info parser gets.
pub trait ImageAccess {
    fn is_64(&self) -> bool;
    fn number_of_symbols(&self) -> u32;
    fn pointer_to_symbol_table(&self) -> Raw;
    fn section_at_index(&self, index: usize) -> Option<&Section>;
    fn section_by_name(&self, name: &str) -> Option<&Section>;
    /// translate a header-relative VA to a runtime-relative one.
    /// identity when the image was loaded at its preferred base.
    fn rebase(&self, va: Va) -> Va;
}

/// Holds the image the debug parsers currently see: the primary by
/// borrow, or a `.gnu_debuglink` companion by value. The companion is
/// owned here and dropped with the gate.
pub enum ImageGate<'a> {
    Primary(&'a Image),
    Companion(Box<Image>),
}

impl<'a> ImageGate<'a> {
    pub fn image(&self) -> &Image {
        match self {
            ImageGate::Primary(image) => image,
            ImageGate::Companion(image) => image,
        }
    }

    /// Swap to a companion image; used when a `.gnu_debuglink` target
    /// replaces the primary for debug-info reading.
    pub fn replace_image(&mut self, companion: Image) {
        *self = ImageGate::Companion(Box::new(companion));
    }
}

impl ImageAccess for ImageGate<'_> {
    fn is_64(&self) -> bool {
        self.image().is_64()
    }

    fn number_of_symbols(&self) -> u32 {
        self.image().nt_headers().file.NumberOfSymbols
    }

    fn pointer_to_symbol_table(&self) -> Raw {
        Raw(self.image().nt_headers().file.PointerToSymbolTable as u64)
    }

    fn section_at_index(&self, index: usize) -> Option<&Section> {
        self.image().map().section_at_index(index)
    }

    fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.image().map().section_by_name(name)
    }

    fn rebase(&self, va: Va) -> Va {
        let image = self.image();
        if !image.rebased() {
            return va;
        }
        Va(va.0
            .wrapping_sub(image.preferred_base().0)
            .wrapping_add(image.image_base().0))
    }
}

/// External debug-info parser (COFF symbols, DWARF sections, ...).
/// Returns the flavors it successfully parsed out of the byte stream.
pub trait DebugReader {
    fn load(&mut self, gate: &ImageGate<'_>, data: &[u8]) -> Result<DebugData>;
}

/// Resolve a `.gnu_debuglink` section to a companion file path.
///
/// The stored name is looked up next to the image; no `.debug/`
/// subdirectory or system search paths.
pub fn debug_link_path(image: &Image) -> Option<PathBuf> {
    let section = image.map().section_by_name(".gnu_debuglink")?;
    if !section.is_mapped() {
        return None;
    }

    let name = image.buf().read_ascii(section.pointer_to_raw_data).ok()?;
    if name.is_empty() {
        return None;
    }

    let path = Path::new(image.path()).parent()?.join(&name);
    debug!("debuglink: {} -> {}", name, path.display());
    Some(path)
}

/// Run the registered debug readers over the image, retargeting through
/// a `.gnu_debuglink` companion when one exists on disk.
pub fn load_debug_info(
    image: &Image,
    readers: &mut [Box<dyn DebugReader>],
) -> (DebugData, Option<PathBuf>) {
    let mut flavors = DebugData::empty();

    let link = debug_link_path(image);

    let mut gate = ImageGate::Primary(image);
    let mut companion_bytes: Option<Vec<u8>> = None;

    if let Some(link) = link.as_ref() {
        if link.exists() {
            let path = link.to_string_lossy();
            match Image::from_path_sections_only(&path) {
                Ok(companion) => {
                    // debug info is read out of the companion from here on.
                    companion_bytes = util::read_file(&path).ok();
                    gate.replace_image(companion);
                }
                Err(e) => warn!("debuglink: failed to parse {}: {:#}", path, e),
            }
        } else {
            debug!("debuglink: target missing: {}", link.display());
        }
    }

    let bytes: &[u8] = match companion_bytes.as_ref() {
        Some(bytes) => bytes,
        None => image.file_data(),
    };

    for reader in readers.iter_mut() {
        match reader.load(&gate, bytes) {
            Ok(found) => flavors |= found,
            Err(e) => warn!("debug: reader failed: {:#}", e),
        }
    }

    (flavors, link)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::{addr::Va, pe::Image, testutil};

    struct CoffProbe;

    impl DebugReader for CoffProbe {
        fn load(&mut self, gate: &ImageGate<'_>, data: &[u8]) -> Result<DebugData> {
            // a real reader would walk the symbol table here.
            if gate.number_of_symbols() == 0 || data.is_empty() {
                return Ok(DebugData::empty());
            }
            Ok(DebugData::COFF)
        }
    }

    #[test]
    fn gate_rebase() -> Result<()> {
        let raw = testutil::hello64().build();
        let image = Image::from_bytes("hello64.exe", raw, Va(0x1_8002_0000))?;
        assert!(image.rebased());

        let gate = ImageGate::Primary(&image);
        assert_eq!(gate.rebase(Va(0x1_8000_1000)), Va(0x1_8002_1000));
        assert!(gate.is_64());

        Ok(())
    }

    #[test]
    fn gate_identity_without_rebase() -> Result<()> {
        let raw = testutil::hello64().build();
        let image = Image::from_bytes("hello64.exe", raw, Va::NULL)?;
        assert!(!image.rebased());

        let gate = ImageGate::Primary(&image);
        assert_eq!(gate.rebase(Va(0x1_8000_1000)), Va(0x1_8000_1000));

        Ok(())
    }

    #[test]
    fn readers_contribute_flavors() -> Result<()> {
        let raw = testutil::hello64().build();
        let image = Image::from_bytes("hello64.exe", raw, Va::NULL)?;

        let mut readers: Vec<Box<dyn DebugReader>> = vec![Box::new(CoffProbe)];
        let (flavors, link) = load_debug_info(&image, &mut readers);

        // the synthetic image carries no symbol table and no debuglink.
        assert_eq!(flavors, DebugData::empty());
        assert!(link.is_none());

        Ok(())
    }
}
