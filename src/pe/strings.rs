//! Scan the whole file image for string literals.
use log::debug;

use crate::{
    addr::{Raw, Va},
    aspace::ImageBuf,
    pe::section::SectionMap,
};

#[derive(Clone, Debug)]
pub struct StringLiteral {
    pub raw:   Raw,
    /// `Va::NULL` when the bytes are not mapped by any section.
    pub va:    Va,
    pub text:  String,
    pub utf16: bool,
}

fn is_printable(b: u8) -> bool {
    b == 10 || b == 13 || (32..=126).contains(&b)
}

/// Single forward pass, no backtracking.
///
/// A printable byte opens a run; the byte after it decides the encoding:
/// a NUL means UTF-16LE code units (stride 2), anything else means ASCII
/// (stride 1). The run ends at the first byte that breaks the pattern,
/// and is emitted when at least `min_length` characters long.
pub fn scan_strings(buf: &ImageBuf, map: &SectionMap, min_length: usize) -> Vec<StringLiteral> {
    let data = buf.data();
    let mut strings = Vec::new();

    let mut i = 0usize;
    while i < data.len() {
        if !is_printable(data[i]) {
            i += 1;
            continue;
        }

        let utf16 = i + 1 < data.len() && data[i + 1] == 0;

        let start = i;
        let mut chars = Vec::new();
        if utf16 {
            while i + 1 < data.len() && is_printable(data[i]) && data[i + 1] == 0 {
                chars.push(data[i]);
                i += 2;
            }
        } else {
            while i < data.len() && is_printable(data[i]) {
                chars.push(data[i]);
                i += 1;
            }
        }

        if chars.len() >= min_length {
            let raw = Raw(start as u64);
            strings.push(StringLiteral {
                raw,
                va: map.raw_to_va(raw),
                // the units are all in the ASCII range by construction.
                text: String::from_utf8_lossy(&chars).into_owned(),
                utf16,
            });
        }
    }

    debug!("strings: {} literals", strings.len());

    strings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Va;

    fn flat_map() -> SectionMap {
        SectionMap {
            image_base:        Va(0x0040_0000),
            virtual_size:      0x1000,
            size_of_headers:   0x1000,
            section_alignment: 0x1000,
            file_alignment:    0x200,
            sections:          vec![],
        }
    }

    #[test]
    fn ascii_runs() {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(b"kernel32.dll");
        data.push(0);
        data.extend_from_slice(b"ab"); // too short
        data.push(0xFF);

        let buf = ImageBuf::new(data);
        let found = scan_strings(&buf, &flat_map(), 4);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "kernel32.dll");
        assert!(!found[0].utf16);
        assert_eq!(found[0].raw, Raw(4));
        assert_eq!(found[0].va, Va(0x0040_0004));
    }

    #[test]
    fn utf16_runs() {
        let mut data = vec![0xCCu8; 2];
        for b in b"Hello" {
            data.push(*b);
            data.push(0);
        }
        data.push(0xCC);

        let buf = ImageBuf::new(data);
        let found = scan_strings(&buf, &flat_map(), 4);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "Hello");
        assert!(found[0].utf16);
    }

    #[test]
    fn minimum_length() {
        let buf = ImageBuf::new(b"\0abc\0defgh\0".to_vec());
        let found = scan_strings(&buf, &flat_map(), 4);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "defgh");
    }
}
