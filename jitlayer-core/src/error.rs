//! Error types for the compile layer and its native engine
//!
//! "Symbol not found" is never an error anywhere in this crate; it is the
//! [`JitSymbol::NotFound`](crate::symbol::JitSymbol::NotFound) value. The
//! variants below are reserved for engine faults and caller contract
//! violations.

use thiserror::Error;

use crate::layer::ModuleSetHandle;

/// Faults reported by a [`NativeEngine`](crate::engine::NativeEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Host ISA or code-generator settings could not be built.
    #[error("failed to configure code generator: {0}")]
    Isa(String),

    /// Declaring, defining or finalizing code in the underlying module failed.
    #[error("module error in '{module}': {message}")]
    Module { module: String, message: String },

    /// A function body referenced a symbol that is not declared in its module set.
    #[error("symbol '{0}' is not declared in this module set")]
    UndeclaredSymbol(String),

    /// Materialization needed an undefined symbol that the resolver could not supply.
    #[error("unresolved symbol '{0}'")]
    UnresolvedSymbol(String),

    /// The native handle does not name a module set resident in the engine.
    #[error("unknown module set {0}")]
    UnknownModuleSet(u64),

    /// A native buffer did not hold the expected encoding.
    #[error("malformed native buffer: expected {expected} bytes, found {found}")]
    Marshalling { expected: usize, found: usize },

    /// A lock guarding engine state was poisoned by a panicking thread.
    #[error("engine state poisoned: {0}")]
    Poisoned(&'static str),
}

impl EngineError {
    pub(crate) fn module(module: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Module {
            module: module.to_string(),
            message: err.to_string(),
        }
    }
}

/// A malformed target data-layout string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataLayoutError {
    #[error("unknown mangling mode '{0}'")]
    UnknownMangling(String),

    #[error("invalid pointer specification '{0}'")]
    InvalidPointerSpec(String),

    #[error("empty data layout component")]
    EmptyComponent,
}

/// Errors surfaced by [`CompileLayer`](crate::layer::CompileLayer) operations.
#[derive(Debug, Error)]
pub enum LayerError {
    /// The handle's module set was already removed. This is a caller bug, not a
    /// runtime condition; it is reported instead of returning stale results.
    #[error("module set handle {0} is no longer active")]
    StaleHandle(ModuleSetHandle),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    DataLayout(#[from] DataLayoutError),
}

impl LayerError {
    /// `true` for errors caused by the caller breaking the layer's contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, LayerError::StaleHandle(_))
    }
}
