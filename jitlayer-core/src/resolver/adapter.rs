//! Resolver adapter
//!
//! Turns a [`SymbolResolver`] into a [`NativeResolver`] the engine can call
//! through the C ABI. The resolver is boxed into a heap context whose address
//! travels with the callback; freeing that context is handed back to the
//! caller as a [`CleanupAction`], which must not run before the engine that
//! received the resolver is released.

use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use super::SymbolResolver;
use crate::ffi::{NativeResolver, RawJitSymbol};
use crate::layer::cleanup::CleanupAction;
use crate::metrics::LayerMetrics;
use crate::symbol::{JitSymbol, MangledSymbol};

/// State reachable from the native callback.
pub struct ResolverContext {
    resolver: Arc<dyn SymbolResolver>,
    metrics: Arc<LayerMetrics>,
}

impl ResolverContext {
    fn resolve(&self, name: &MangledSymbol) -> JitSymbol {
        self.metrics.record_resolver_invocation();
        self.resolver.resolve(name)
    }
}

/// Entry point the engine calls. Never unwinds into the engine.
unsafe extern "C" fn resolve_trampoline(name: *const c_char, context: *mut c_void) -> RawJitSymbol {
    if name.is_null() || context.is_null() {
        return RawJitSymbol::NOT_FOUND;
    }
    // SAFETY: `context` is the `ResolverContext` leaked by `adapt`, kept alive
    // until its cleanup action runs after the engine is released.
    let context = &*(context as *const ResolverContext);
    let name = MangledSymbol::from_bytes(CStr::from_ptr(name).to_bytes());

    match panic::catch_unwind(AssertUnwindSafe(|| context.resolve(&name))) {
        Ok(symbol) => {
            trace!(symbol = %name, found = symbol.is_found(), "Resolver answered");
            symbol.into_raw()
        }
        Err(_) => {
            context.metrics.record_resolver_panic();
            error!(symbol = %name, "Symbol resolver panicked; reporting symbol as not found");
            RawJitSymbol::NOT_FOUND
        }
    }
}

/// Adapt `resolver` for the native engine.
///
/// Returns the engine-callable resolver and the action that frees its
/// context. The resolver stays callable until that action runs.
pub fn adapt(
    resolver: Arc<dyn SymbolResolver>,
    metrics: Arc<LayerMetrics>,
    label: impl Into<String>,
) -> (NativeResolver, CleanupAction) {
    let context = Box::into_raw(Box::new(ResolverContext { resolver, metrics }));
    let address = context as usize;

    // SAFETY: the context is valid until the cleanup action below runs, and
    // `ResolverContext` is Send + Sync so the callback may run on any thread.
    let native = unsafe { NativeResolver::new(resolve_trampoline, context as *mut c_void) };

    let cleanup = CleanupAction::new(label, move || {
        // SAFETY: `address` came from `Box::into_raw` above and the action runs once.
        drop(unsafe { Box::from_raw(address as *mut ResolverContext) });
    });
    (native, cleanup)
}
