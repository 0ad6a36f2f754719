//! FFI Bridge - C-ABI types shared with the native JIT engine
//!
//! The engine speaks a handle-based, C-compatible protocol: symbol lookups
//! come back as [`RawJitSymbol`] values written into native buffers, and
//! lazy resolution calls back into Rust through a [`NativeResolverFn`]
//! paired with an opaque context pointer.

use std::ffi::{c_char, c_void, CStr, CString};

use crate::error::EngineError;
use crate::engine::buffer::NativeBuffer;

/// Opaque handle identifying a module set inside a native engine.
pub type NativeModuleSetHandle = u64;

/// Lookup result in the engine's C layout.
///
/// An `address` of zero means "not found".
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawJitSymbol {
    pub address: u64,
    /// Bit set matching [`SymbolFlags`](crate::symbol::SymbolFlags).
    pub flags: u8,
}

impl RawJitSymbol {
    pub const NOT_FOUND: RawJitSymbol = RawJitSymbol {
        address: 0,
        flags: 0,
    };

    /// Size of the little-endian wire form stored in native buffers.
    pub const ENCODED_LEN: usize = 9;

    pub fn encode_into(&self, buffer: &mut NativeBuffer) {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[..8].copy_from_slice(&self.address.to_le_bytes());
        bytes[8] = self.flags;
        buffer.write(&bytes);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(EngineError::Marshalling {
                expected: Self::ENCODED_LEN,
                found: bytes.len(),
            });
        }
        let mut address = [0u8; 8];
        address.copy_from_slice(&bytes[..8]);
        Ok(RawJitSymbol {
            address: u64::from_le_bytes(address),
            flags: bytes[8],
        })
    }
}

/// Calling convention the engine uses to request lazy resolution of an
/// undefined symbol. `name` is the NUL-terminated mangled name and `context`
/// is the pointer registered alongside the callback.
pub type NativeResolverFn =
    unsafe extern "C" fn(name: *const c_char, context: *mut c_void) -> RawJitSymbol;

/// A resolution callback in engine-invocable form.
///
/// Copies of this value may be invoked from any engine thread until the
/// owner of `context` releases it.
#[derive(Clone, Copy)]
pub struct NativeResolver {
    callback: NativeResolverFn,
    context: *mut c_void,
}

// SAFETY: `NativeResolver::new` requires the context to be usable from any
// thread for as long as the resolver can be invoked.
unsafe impl Send for NativeResolver {}
unsafe impl Sync for NativeResolver {}

impl NativeResolver {
    /// # Safety
    /// `context` must remain valid, and `callback(_, context)` must be safe
    /// to call concurrently from arbitrary threads, until every engine that
    /// received this resolver has been disposed.
    pub unsafe fn new(callback: NativeResolverFn, context: *mut c_void) -> Self {
        Self { callback, context }
    }

    pub fn context(&self) -> *mut c_void {
        self.context
    }

    pub fn resolve(&self, name: &CStr) -> RawJitSymbol {
        // SAFETY: upheld by the contract of `NativeResolver::new`.
        unsafe { (self.callback)(name.as_ptr(), self.context) }
    }

    /// Resolve a mangled name given as bytes. Names that cannot be passed
    /// through the C boundary (interior NUL) are never found.
    pub fn resolve_bytes(&self, name: &[u8]) -> RawJitSymbol {
        match CString::new(name) {
            Ok(name) => self.resolve(&name),
            Err(_) => RawJitSymbol::NOT_FOUND,
        }
    }
}

impl std::fmt::Debug for NativeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeResolver")
            .field("callback", &(self.callback as *const ()))
            .field("context", &self.context)
            .finish()
    }
}
