use anyhow::Result;
use log::{debug, warn};

use crate::{
    addr::Va,
    aspace::ImageBuf,
    pe::{dirs::DirectoryAnchor, section::SectionMap},
};

/// Collect the TLS callback chain.
///
/// The TLS directory starts with three pointer-sized fields (raw data
/// start/end, index address); the fourth is `AddressOfCallBacks`, a VA
/// pointing at a NUL-terminated array of callback VAs. All of these are
/// absolute addresses, so this must run after relocations are applied.
pub fn read_tls_callbacks(
    buf: &ImageBuf,
    map: &SectionMap,
    anchor: &DirectoryAnchor,
    is_64: bool,
) -> Result<Vec<Va>> {
    let mut callbacks = Vec::new();

    if !anchor.is_present() {
        return Ok(callbacks);
    }

    let dir_raw = map.va_to_raw(anchor.va);
    if dir_raw.is_null() {
        warn!("tls: directory not mapped: {:#x}", anchor.va);
        return Ok(callbacks);
    }

    let psize = if is_64 { 8u64 } else { 4u64 };
    let callbacks_va = Va(buf.read_pointer(is_64, dir_raw + 3 * psize)?);
    if callbacks_va.is_null() {
        return Ok(callbacks);
    }

    let table_raw = map.va_to_raw(callbacks_va);
    if table_raw.is_null() {
        warn!("tls: callback table not mapped: {:#x}", callbacks_va);
        return Ok(callbacks);
    }

    for i in 0.. {
        let callback = buf.read_pointer(is_64, table_raw + i * psize)?;
        if callback == 0 {
            break;
        }
        debug!("tls: callback {}: {:#x}", i, callback);
        callbacks.push(Va(callback));
    }

    Ok(callbacks)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::{addr::Va, pe::Image, testutil};

    #[test]
    fn two_callbacks() -> Result<()> {
        let raw = testutil::tls_exe64().build();
        let image = Image::from_bytes("tls64.exe", raw, Va::NULL)?;

        let names: Vec<&str> = image.entry_points().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["EntryPoint", "Tls Callback 0", "Tls Callback 1"]);

        Ok(())
    }

    #[test]
    fn callbacks_follow_rebase() -> Result<()> {
        testutil::init_logging();

        // preferred 0x180000000, loaded at 0x180010000: the callback
        // pointers are patched before the TLS walk reads them.
        let raw = testutil::tls_exe64().build();
        let image = Image::from_bytes("tls64.exe", raw, Va(0x1_8001_0000))?;

        assert!(image.rebased());
        assert_eq!(image.relocation_delta(), 0x1_0000);
        assert_eq!(image.entry_points().len(), 3);

        let base = image.image_base();
        let end = base + image.virtual_size() as u64;
        for entry in image.entry_points() {
            assert!(entry.va.0 >= base.0 && entry.va.0 < end.0);
        }

        Ok(())
    }
}
