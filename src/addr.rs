//! The three coordinate systems of a PE image.
//!
//! A `Raw` is a byte offset from the start of the on-disk file.
//! An `Rva` is an offset from the image base, as mapped into memory.
//! A `Va` is an absolute address in the target process.
//!
//! These are deliberately distinct types: mixing them is almost always a
//! bug, and the only component that may convert between them is the
//! section map (see `crate::pe::section::SectionMap`).
use std::fmt;

/// Byte offset from the start of the file image.
/// `Raw::NULL` is the "not mapped" sentinel.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Raw(pub u64);

/// Relative Virtual Address: offset from the image base.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Rva(pub u64);

/// Virtual Address: absolute address in the target process.
/// `Va::NULL` is the "absent" sentinel.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Va(pub u64);

impl Raw {
    pub const NULL: Raw = Raw(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl Va {
    pub const NULL: Va = Va(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl Rva {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

// striding within one coordinate system is fine anywhere;
// crossing systems is the section map's job.

impl std::ops::Add<u64> for Raw {
    type Output = Raw;
    fn add(self, rhs: u64) -> Raw {
        Raw(self.0 + rhs)
    }
}

impl std::ops::Add<u64> for Rva {
    type Output = Rva;
    fn add(self, rhs: u64) -> Rva {
        Rva(self.0 + rhs)
    }
}

impl std::ops::Add<u64> for Va {
    type Output = Va;
    fn add(self, rhs: u64) -> Va {
        Va(self.0 + rhs)
    }
}

impl fmt::Debug for Raw {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Raw({:#x})", self.0)
    }
}

impl fmt::Debug for Rva {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Rva({:#x})", self.0)
    }
}

impl fmt::Debug for Va {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}

impl fmt::LowerHex for Raw {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for Rva {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for Va {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels() {
        assert!(Raw::NULL.is_null());
        assert!(!Raw(0x400).is_null());
        assert!(Va::NULL.is_null());
        assert!(Rva::default().is_zero());
    }

    #[test]
    fn stride() {
        assert_eq!(Raw(0x400) + 0x10, Raw(0x410));
        assert_eq!(Rva(0x1000) + 4, Rva(0x1004));
        assert_eq!(Va(0x40_0000) + 0x1000, Va(0x40_1000));
    }
}
