//! Engine module - the native JIT engine behind a compile layer
//!
//! [`NativeEngine`] is the handle-based contract a compile layer drives:
//! results come back in engine-owned [`NativeBuffer`]s that must be handed
//! back, module sets are named by opaque native ids, and lazy resolution goes
//! through a [`NativeResolver`]. [`JitEngine`] implements it on top of
//! cranelift-jit.

pub mod buffer;
pub mod data_layout;
pub mod jit;
pub mod module;

pub use buffer::{BufferPool, BufferPoolStats, NativeBuffer, ScopedBuffer};
pub use data_layout::{DataLayout, ManglingMode};
pub use jit::JitEngine;
pub use module::{Module, ModuleScope, NativeModule, Visibility};

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::EngineError;
use crate::ffi::NativeResolver;
use crate::symbol::MangledSymbol;

/// The native engine operations a compile layer is built from.
///
/// Every buffer returned by a `get_*`/`find_*` call must be passed back to the
/// matching `dispose_*` call exactly once.
pub trait NativeEngine: Send + Sync {
    /// Native handle for a registered module set.
    type ModuleSetId: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Write the mangled form of `raw_name` under `layout` into a new buffer.
    fn get_mangled_symbol(
        &self,
        raw_name: &str,
        layout: &DataLayout,
    ) -> Result<NativeBuffer, EngineError>;

    fn dispose_mangled_symbol(&self, buffer: NativeBuffer);

    /// Search every resident module set, in registration order. The buffer
    /// holds an encoded [`RawJitSymbol`](crate::ffi::RawJitSymbol).
    fn find_symbol(
        &self,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<NativeBuffer, EngineError>;

    /// Search a single module set.
    fn find_symbol_in(
        &self,
        id: Self::ModuleSetId,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<NativeBuffer, EngineError>;

    fn dispose_symbol(&self, buffer: NativeBuffer);

    /// Take ownership of `modules` and make them resident. `resolver` answers
    /// the modules' undefined symbols whenever the engine needs them.
    fn add_module_set(
        &self,
        layout: &DataLayout,
        modules: Vec<NativeModule>,
        resolver: NativeResolver,
    ) -> Result<Self::ModuleSetId, EngineError>;

    /// Release the compiled code of a module set. `id` is invalid afterwards.
    fn remove_module_set(&self, id: Self::ModuleSetId) -> Result<(), EngineError>;

    /// Release the engine and everything resident in it.
    fn dispose(self) -> Result<(), EngineError>
    where
        Self: Sized;
}
