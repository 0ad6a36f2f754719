//! Target data layout and symbol mangling
//!
//! A data layout is described by an LLVM-style string such as
//! `e-m:o-i64:64-n32:64-S128`. Only the parts that influence symbol naming
//! and pointer width are interpreted; the full string is preserved.

use std::fmt;
use std::str::FromStr;

use crate::error::DataLayoutError;

/// How global symbol names are decorated for the object format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManglingMode {
    /// No `m:` component.
    None,
    /// `m:e`
    Elf,
    /// `m:m`
    Mips,
    /// `m:o`
    MachO,
    /// `m:w`
    WinCoff,
    /// `m:x`
    WinCoffX86,
    /// `m:l`
    Goff,
    /// `m:a`
    XCoff,
}

impl ManglingMode {
    fn from_code(code: &str) -> Result<Self, DataLayoutError> {
        Ok(match code {
            "e" => ManglingMode::Elf,
            "m" => ManglingMode::Mips,
            "o" => ManglingMode::MachO,
            "w" => ManglingMode::WinCoff,
            "x" => ManglingMode::WinCoffX86,
            "l" => ManglingMode::Goff,
            "a" => ManglingMode::XCoff,
            other => return Err(DataLayoutError::UnknownMangling(other.to_string())),
        })
    }

    /// Prefix prepended to every global symbol.
    pub fn global_prefix(self) -> Option<u8> {
        match self {
            ManglingMode::MachO | ManglingMode::WinCoffX86 => Some(b'_'),
            _ => None,
        }
    }

    /// MSVC C++ names start with `?` and are already in final form.
    fn keeps_leading_question_mark(self) -> bool {
        matches!(self, ManglingMode::WinCoff | ManglingMode::WinCoffX86)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

/// Parsed target data layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataLayout {
    repr: String,
    endianness: Endianness,
    mangling: ManglingMode,
    pointer_size_bits: u32,
}

/// Names starting with this byte bypass mangling entirely.
const VERBATIM_MARKER: u8 = 0x01;

impl DataLayout {
    pub fn parse(repr: &str) -> Result<Self, DataLayoutError> {
        let mut layout = DataLayout {
            repr: repr.to_string(),
            endianness: Endianness::Little,
            mangling: ManglingMode::None,
            pointer_size_bits: 64,
        };
        if repr.is_empty() {
            return Ok(layout);
        }

        for component in repr.split('-') {
            match component {
                "" => return Err(DataLayoutError::EmptyComponent),
                "e" => layout.endianness = Endianness::Little,
                "E" => layout.endianness = Endianness::Big,
                c if c.starts_with("m:") => layout.mangling = ManglingMode::from_code(&c[2..])?,
                // Only the default address space sets the pointer width.
                c if c.starts_with("p:") || c.starts_with("p0:") => {
                    let size = c
                        .split(':')
                        .nth(1)
                        .and_then(|s| s.parse::<u32>().ok())
                        .ok_or_else(|| DataLayoutError::InvalidPointerSpec(c.to_string()))?;
                    layout.pointer_size_bits = size;
                }
                _ => {}
            }
        }
        Ok(layout)
    }

    /// The layout of the process this crate runs in.
    pub fn host() -> Self {
        // The host strings below are all well-formed.
        Self::parse(host_layout_string()).unwrap_or_else(|_| DataLayout {
            repr: String::new(),
            endianness: Endianness::Little,
            mangling: ManglingMode::None,
            pointer_size_bits: usize::BITS,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn mangling(&self) -> ManglingMode {
        self.mangling
    }

    pub fn pointer_size_bits(&self) -> u32 {
        self.pointer_size_bits
    }

    /// Native symbol-table name for the global `raw_name`.
    ///
    /// Pure function of `(self, raw_name)`.
    pub fn mangle(&self, raw_name: &str) -> Vec<u8> {
        let bytes = raw_name.as_bytes();
        if let Some((&VERBATIM_MARKER, rest)) = bytes.split_first() {
            return rest.to_vec();
        }
        if self.mangling.keeps_leading_question_mark() && bytes.first() == Some(&b'?') {
            return bytes.to_vec();
        }
        let mut out = Vec::with_capacity(bytes.len() + 1);
        if let Some(prefix) = self.mangling.global_prefix() {
            out.push(prefix);
        }
        out.extend_from_slice(bytes);
        out
    }
}

impl FromStr for DataLayout {
    type Err = DataLayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

fn host_layout_string() -> &'static str {
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "e-m:o-i64:64-i128:128-n32:64-S128-Fn32"
    } else if cfg!(target_os = "macos") {
        "e-m:o-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128"
    } else if cfg!(all(target_os = "windows", target_arch = "x86")) {
        "e-m:x-p:32:32-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:32-n8:16:32-a:0:32-S32"
    } else if cfg!(target_os = "windows") {
        "e-m:w-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128"
    } else if cfg!(target_arch = "aarch64") {
        "e-m:e-i8:8:32-i16:16:32-i64:64-i128:128-n32:64-S128-Fn32"
    } else if cfg!(target_arch = "riscv64") {
        "e-m:e-p:64:64-i64:64-i128:128-n32:64-S128"
    } else {
        "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELF: &str = "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128";
    const MACHO: &str = "e-m:o-i64:64-i128:128-n32:64-S128";
    const WIN32: &str = "e-m:x-p:32:32-i64:64-f80:32-n8:16:32-a:0:32-S32";

    #[test]
    fn test_parse_mangling_modes() {
        assert_eq!(DataLayout::parse(ELF).unwrap().mangling(), ManglingMode::Elf);
        assert_eq!(DataLayout::parse(MACHO).unwrap().mangling(), ManglingMode::MachO);
        assert_eq!(DataLayout::parse(WIN32).unwrap().mangling(), ManglingMode::WinCoffX86);
        assert_eq!(DataLayout::parse("E").unwrap().mangling(), ManglingMode::None);
        assert_eq!(DataLayout::parse("E").unwrap().endianness(), Endianness::Big);
    }

    #[test]
    fn test_parse_pointer_size() {
        assert_eq!(DataLayout::parse(WIN32).unwrap().pointer_size_bits(), 32);
        // p270 is a non-default address space and must not change the width.
        assert_eq!(DataLayout::parse(ELF).unwrap().pointer_size_bits(), 64);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DataLayout::parse("e-m:q").unwrap_err(),
            DataLayoutError::UnknownMangling("q".into())
        );
        assert_eq!(
            DataLayout::parse("e--S128").unwrap_err(),
            DataLayoutError::EmptyComponent
        );
        assert!(matches!(
            DataLayout::parse("p:abc:64"),
            Err(DataLayoutError::InvalidPointerSpec(_))
        ));
    }

    #[test]
    fn test_mangle_by_object_format() {
        assert_eq!(DataLayout::parse(ELF).unwrap().mangle("foo"), b"foo");
        assert_eq!(DataLayout::parse(MACHO).unwrap().mangle("foo"), b"_foo");
        assert_eq!(DataLayout::parse(WIN32).unwrap().mangle("foo"), b"_foo");
    }

    #[test]
    fn test_mangle_verbatim_marker() {
        let layout = DataLayout::parse(MACHO).unwrap();
        assert_eq!(layout.mangle("\u{1}exact"), b"exact");
    }

    #[test]
    fn test_mangle_msvc_names_untouched() {
        let layout = DataLayout::parse(WIN32).unwrap();
        assert_eq!(layout.mangle("?f@@YAXXZ"), b"?f@@YAXXZ");
        assert_eq!(DataLayout::parse(MACHO).unwrap().mangle("?f"), b"_?f");
    }

    #[test]
    fn test_mangle_is_deterministic() {
        let layout = DataLayout::host();
        assert_eq!(layout.mangle("answer"), layout.mangle("answer"));
        assert_eq!(layout.to_string(), layout.as_str());
    }
}
