//! Generation-checked identifiers
//!
//! An `Ident` packs a slot index (low 32 bits) with the generation of that
//! slot (high 32 bits). When a slot is reused its generation is bumped, so
//! an ident held past the lifetime of its object never resolves to the
//! object that replaced it.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Ident(u64);

impl Ident {
    /// Sentinel value indicating "no object"
    pub const NONE: Ident = Ident(u64::MAX);

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Ident(((generation as u64) << 32) | index as u64)
    }

    /// Rebuild from the packed value (completion keys, mio tokens).
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Ident(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Ident(NONE)")
        } else {
            write!(f, "Ident({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "{}v{}", self.index(), self.generation())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let id = Ident::new(42, 7);
        assert_eq!(id.index(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(Ident::from_u64(id.as_u64()), id);
    }

    #[test]
    fn test_none() {
        assert!(Ident::NONE.is_none());
        assert!(!Ident::NONE.is_some());
        assert!(Ident::new(0, 0).is_some());
    }

    #[test]
    fn test_generation_distinguishes() {
        assert_ne!(Ident::new(3, 1), Ident::new(3, 2));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Ident::new(5, 2)), "5v2");
        assert_eq!(format!("{:?}", Ident::NONE), "Ident(NONE)");
    }
}
