//! Symbol names and lookup results

use std::fmt;

use crate::ffi::RawJitSymbol;

/// A symbol name as it appears in the engine's native symbol table.
///
/// Produced by [`CompileLayer::mangle`](crate::layer::CompileLayer::mangle);
/// raw source-level names must be mangled before they are used for lookup.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MangledSymbol(Box<[u8]>);

impl MangledSymbol {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for MangledSymbol {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }
}

impl fmt::Display for MangledSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MangledSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MangledSymbol({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Visibility and kind bits attached to a resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SymbolFlags(u8);

impl SymbolFlags {
    pub const NONE: SymbolFlags = SymbolFlags(0);
    /// Externally visible linkage.
    pub const EXPORTED: SymbolFlags = SymbolFlags(1 << 0);
    /// The address is a function entry point.
    pub const CALLABLE: SymbolFlags = SymbolFlags(1 << 1);
    pub const WEAK: SymbolFlags = SymbolFlags(1 << 2);
    /// The address was supplied from outside the engine.
    pub const ABSOLUTE: SymbolFlags = SymbolFlags(1 << 3);

    pub const fn from_bits(bits: u8) -> Self {
        SymbolFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: SymbolFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: SymbolFlags) -> Self {
        SymbolFlags(self.0 | other.0)
    }

    pub const fn is_exported(self) -> bool {
        self.contains(Self::EXPORTED)
    }

    pub const fn is_callable(self) -> bool {
        self.contains(Self::CALLABLE)
    }
}

impl std::ops::BitOr for SymbolFlags {
    type Output = SymbolFlags;

    fn bitor(self, rhs: SymbolFlags) -> SymbolFlags {
        self.union(rhs)
    }
}

/// Result of a symbol lookup or resolution.
///
/// `NotFound` is an ordinary outcome, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JitSymbol {
    NotFound,
    Found { address: u64, flags: SymbolFlags },
}

impl JitSymbol {
    /// A present symbol. A zero address is indistinguishable from "absent"
    /// at the native boundary, so it yields `NotFound`.
    pub fn found(address: u64, flags: SymbolFlags) -> Self {
        if address == 0 {
            JitSymbol::NotFound
        } else {
            JitSymbol::Found { address, flags }
        }
    }

    /// An exported, callable address supplied by the caller, typically the
    /// answer a resolver gives for a host function.
    pub fn absolute(address: u64) -> Self {
        Self::found(
            address,
            SymbolFlags::EXPORTED | SymbolFlags::CALLABLE | SymbolFlags::ABSOLUTE,
        )
    }

    pub fn is_found(&self) -> bool {
        matches!(self, JitSymbol::Found { .. })
    }

    pub fn address(&self) -> Option<u64> {
        match self {
            JitSymbol::Found { address, .. } => Some(*address),
            JitSymbol::NotFound => None,
        }
    }

    pub fn flags(&self) -> Option<SymbolFlags> {
        match self {
            JitSymbol::Found { flags, .. } => Some(*flags),
            JitSymbol::NotFound => None,
        }
    }

    pub fn from_raw(raw: RawJitSymbol) -> Self {
        Self::found(raw.address, SymbolFlags::from_bits(raw.flags))
    }

    pub fn into_raw(self) -> RawJitSymbol {
        match self {
            JitSymbol::Found { address, flags } => RawJitSymbol {
                address,
                flags: flags.bits(),
            },
            JitSymbol::NotFound => RawJitSymbol::NOT_FOUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_address_is_not_found() {
        assert_eq!(JitSymbol::found(0, SymbolFlags::EXPORTED), JitSymbol::NotFound);
        assert!(!JitSymbol::from_raw(RawJitSymbol::NOT_FOUND).is_found());
    }

    #[test]
    fn test_absolute_symbol_flags() {
        let sym = JitSymbol::absolute(0x1000);
        let flags = sym.flags().unwrap();
        assert!(flags.is_exported());
        assert!(flags.is_callable());
        assert!(flags.contains(SymbolFlags::ABSOLUTE));
        assert_eq!(sym.address(), Some(0x1000));
    }

    #[test]
    fn test_raw_conversion_preserves_flags() {
        let sym = JitSymbol::found(0xdead_beef, SymbolFlags::CALLABLE);
        let back = JitSymbol::from_raw(sym.into_raw());
        assert_eq!(back, sym);
        assert!(!back.flags().unwrap().is_exported());
    }

    #[test]
    fn test_mangled_symbol_display() {
        let sym = MangledSymbol::from_bytes(b"_foo");
        assert_eq!(sym.to_string(), "_foo");
        assert_eq!(sym.len(), 4);
        assert_eq!(MangledSymbol::from(b"_foo".to_vec()), sym);
    }
}
