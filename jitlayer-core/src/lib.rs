//! Jitlayer Core - compile-layer management for a JIT execution engine
//!
//! Registers batches of compiled modules ("module sets") with a native JIT
//! engine, mangles symbol names for the target, looks symbols up globally or
//! per module set, and routes the engine's lazy undefined-symbol requests to
//! caller-supplied resolvers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use jitlayer_core::engine::module::{types, InstBuilder};
//! use jitlayer_core::resolver::resolver_fn;
//! use jitlayer_core::{CompileLayer, JitCompileLayer, JitSymbol, LayerConfig, Module, Visibility};
//!
//! # fn main() -> Result<(), jitlayer_core::LayerError> {
//! let layer = JitCompileLayer::from_config(&LayerConfig::default())?;
//!
//! let mut module = Module::new("consts");
//! module.define_function("foo", Visibility::Exported, &[], &[types::I64], |b, _| {
//!     let entry = b.create_block();
//!     b.switch_to_block(entry);
//!     b.seal_block(entry);
//!     let v = b.ins().iconst(types::I64, 42);
//!     b.ins().return_(&[v]);
//!     Ok(())
//! });
//!
//! let handle = layer.add_module_set(vec![module], Arc::new(resolver_fn(|_| JitSymbol::NotFound)))?;
//! let foo = layer.mangle("foo")?;
//! assert!(layer.find_symbol(&foo, true)?.is_found());
//! layer.remove_module_set(handle)?;
//! layer.dispose()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Design:
//! - Handles are generation-checked, so a removed set is reported, never read
//! - Modules move into the engine at registration
//! - Native buffers are released on every exit path
//! - Resolvers are `Send + Sync` and live as long as the layer

pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod layer;
pub mod metrics;
pub mod resolver;
pub mod symbol;

pub use config::{EngineConfig, LayerConfig, OptLevel};
pub use engine::{DataLayout, JitEngine, Module, NativeEngine, Visibility};
pub use error::{DataLayoutError, EngineError, LayerError};
pub use layer::{CompileLayer, JitCompileLayer, ModuleSetHandle};
pub use metrics::{LayerMetrics, MetricsSnapshot};
pub use resolver::SymbolResolver;
pub use symbol::{JitSymbol, MangledSymbol, SymbolFlags};

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the logging subscriber. Honors `RUST_LOG`; calling it again is a
/// no-op.
pub fn init() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive("jitlayer_core=info".parse()?)
        .from_env_lossy();

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        info!("Initializing Jitlayer v{}", env!("CARGO_PKG_VERSION"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }
}
