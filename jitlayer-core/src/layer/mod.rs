//! Compile layer - module set lifecycle and symbol lookup over a native engine
//!
//! A compile layer owns one [`NativeEngine`], the data layout its symbols are
//! mangled under, the registry of module set handles it has issued, and the
//! cleanup actions produced while adapting resolvers.
//!
//! # Lifetimes:
//! - Removing a module set releases its compiled code but not its resolver.
//!   Resolvers stay callable, and shared across later lazy resolutions, until
//!   the whole layer is disposed.
//! - [`CompileLayer::dispose`] releases the engine first, then runs the
//!   cleanup actions in reverse registration order. Dropping a layer without
//!   disposing it does the same.

pub mod cleanup;
pub mod registry;

pub use cleanup::{CleanupAction, CleanupRegistry};
pub use registry::{ModuleSetHandle, ModuleSetRegistry};

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::config::LayerConfig;
use crate::engine::buffer::with_scoped_buffer;
use crate::engine::{DataLayout, JitEngine, Module, NativeEngine, NativeModule};
use crate::error::{EngineError, LayerError};
use crate::ffi::RawJitSymbol;
use crate::metrics::{LayerMetrics, ScopedTimer, TimerType};
use crate::resolver::{adapter, SymbolResolver};
use crate::symbol::{JitSymbol, MangledSymbol};

/// Operations shared by every compile layer variant.
pub trait CompileLayer {
    /// The data layout symbols are mangled under.
    fn data_layout(&self) -> &DataLayout;

    /// Mangle `raw_name` into the engine's native symbol-table form.
    fn mangle(&self, raw_name: &str) -> Result<MangledSymbol, LayerError>;

    /// Register `modules` as one module set. Undefined symbols in the set are
    /// resolved lazily through `resolver`, possibly on another thread.
    fn add_module_set(
        &self,
        modules: Vec<Module>,
        resolver: Arc<dyn SymbolResolver>,
    ) -> Result<ModuleSetHandle, LayerError>;

    /// Unregister a module set and release its compiled code.
    fn remove_module_set(&self, handle: ModuleSetHandle) -> Result<(), LayerError>;

    /// Search every active module set, in registration order.
    fn find_symbol(
        &self,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<JitSymbol, LayerError>;

    /// Search the module set behind `handle` only.
    fn find_symbol_in(
        &self,
        handle: ModuleSetHandle,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<JitSymbol, LayerError>;

    /// Register `modules`, run `body` with the new handle, and unregister the
    /// set exactly once however `body` exits (return, error or panic).
    ///
    /// An error from `body` takes precedence over an error removing the set.
    fn with_module_set<T, F>(
        &self,
        modules: Vec<Module>,
        resolver: Arc<dyn SymbolResolver>,
        body: F,
    ) -> Result<T, LayerError>
    where
        Self: Sized,
        F: FnOnce(&Self, ModuleSetHandle) -> Result<T, LayerError>,
    {
        let handle = self.add_module_set(modules, resolver)?;
        let guard = RemoveOnExit {
            layer: self,
            handle: Some(handle),
        };
        let result = body(self, handle);
        let removed = guard.finish();

        match (result, removed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(remove_err)) => {
                warn!(%handle, error = %remove_err, "Failed to remove module set after body error");
                Err(e)
            }
        }
    }

    /// Release the layer. Terminal.
    fn dispose(self) -> Result<(), LayerError>
    where
        Self: Sized;
}

/// Removes a module set when dropped, unless `finish` already did.
struct RemoveOnExit<'a, L: CompileLayer> {
    layer: &'a L,
    handle: Option<ModuleSetHandle>,
}

impl<'a, L: CompileLayer> RemoveOnExit<'a, L> {
    fn finish(mut self) -> Result<(), LayerError> {
        match self.handle.take() {
            Some(handle) => self.layer.remove_module_set(handle),
            None => Ok(()),
        }
    }
}

impl<'a, L: CompileLayer> Drop for RemoveOnExit<'a, L> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.layer.remove_module_set(handle) {
                error!(%handle, error = %e, "Failed to remove module set while unwinding");
            }
        }
    }
}

/// A compile layer over a [`NativeEngine`], by default the Cranelift-backed
/// [`JitEngine`].
pub struct JitCompileLayer<E: NativeEngine = JitEngine> {
    // Declared before `cleanups`: the engine must be released before any
    // resolver context it may still call into.
    engine: E,
    data_layout: Arc<DataLayout>,
    registry: Mutex<ModuleSetRegistry<E::ModuleSetId>>,
    cleanups: CleanupRegistry,
    metrics: Arc<LayerMetrics>,
}

impl JitCompileLayer<JitEngine> {
    /// Build a host JIT engine and a layer over it.
    pub fn from_config(config: &LayerConfig) -> Result<Self, LayerError> {
        let data_layout = Arc::new(config.data_layout()?);
        let engine = JitEngine::new(config.engine.clone())?;
        Ok(Self::new(engine, data_layout))
    }
}

impl<E: NativeEngine> JitCompileLayer<E> {
    pub fn new(engine: E, data_layout: Arc<DataLayout>) -> Self {
        info!(data_layout = %data_layout, "Created compile layer");
        Self {
            engine,
            data_layout,
            registry: Mutex::new(ModuleSetRegistry::new()),
            cleanups: CleanupRegistry::new(),
            metrics: LayerMetrics::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn shared_data_layout(&self) -> &Arc<DataLayout> {
        &self.data_layout
    }

    pub fn metrics(&self) -> &Arc<LayerMetrics> {
        &self.metrics
    }

    /// Handles of the module sets currently registered.
    pub fn active_module_sets(&self) -> Vec<ModuleSetHandle> {
        self.registry
            .lock()
            .map(|registry| registry.handles())
            .unwrap_or_default()
    }

    /// Number of cleanup actions that will run at disposal.
    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.len()
    }

    fn registry(&self) -> Result<MutexGuard<'_, ModuleSetRegistry<E::ModuleSetId>>, LayerError> {
        self.registry
            .lock()
            .map_err(|_| EngineError::Poisoned("module set registry").into())
    }

    fn native_id(&self, handle: ModuleSetHandle) -> Result<E::ModuleSetId, LayerError> {
        self.registry()?
            .get(handle)
            .ok_or(LayerError::StaleHandle(handle))
    }

    fn read_symbol(
        &self,
        lookup: impl FnOnce() -> Result<crate::engine::NativeBuffer, EngineError>,
    ) -> Result<JitSymbol, LayerError> {
        let mut timer = ScopedTimer::new(&self.metrics, TimerType::Lookup);
        let symbol = with_scoped_buffer(
            lookup,
            |buffer| self.engine.dispose_symbol(buffer),
            |buffer| RawJitSymbol::decode(buffer.as_slice()).map(JitSymbol::from_raw),
        )?;
        if symbol.is_found() {
            timer.succeed();
        }
        Ok(symbol)
    }
}

impl<E: NativeEngine> CompileLayer for JitCompileLayer<E> {
    fn data_layout(&self) -> &DataLayout {
        &self.data_layout
    }

    fn mangle(&self, raw_name: &str) -> Result<MangledSymbol, LayerError> {
        self.metrics.record_mangle();
        let mangled = with_scoped_buffer(
            || self.engine.get_mangled_symbol(raw_name, &self.data_layout),
            |buffer| self.engine.dispose_mangled_symbol(buffer),
            |buffer| Ok::<_, EngineError>(MangledSymbol::from_bytes(buffer.as_slice())),
        )?;
        Ok(mangled)
    }

    fn add_module_set(
        &self,
        modules: Vec<Module>,
        resolver: Arc<dyn SymbolResolver>,
    ) -> Result<ModuleSetHandle, LayerError> {
        let mut timer = ScopedTimer::new(&self.metrics, TimerType::Registration);

        let natives: Vec<NativeModule> = modules.into_iter().map(Module::into_native).collect();
        let names = natives
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let count = natives.len();

        // The adapted resolver belongs to the layer, not to this module set.
        let (native_resolver, cleanup) = adapter::adapt(
            resolver,
            Arc::clone(&self.metrics),
            format!("resolver for [{names}]"),
        );
        self.cleanups.push(cleanup);

        let id = self
            .engine
            .add_module_set(&self.data_layout, natives, native_resolver)?;
        let handle = self.registry()?.insert(id);
        timer.succeed();

        info!(%handle, native = ?id, modules = count, names = %names, "Registered module set");
        Ok(handle)
    }

    fn remove_module_set(&self, handle: ModuleSetHandle) -> Result<(), LayerError> {
        let id = self
            .registry()?
            .remove(handle)
            .ok_or(LayerError::StaleHandle(handle))?;
        self.engine.remove_module_set(id)?;
        self.metrics.record_removal();
        info!(%handle, native = ?id, "Removed module set");
        Ok(())
    }

    fn find_symbol(
        &self,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<JitSymbol, LayerError> {
        let symbol = self.read_symbol(|| self.engine.find_symbol(name, exported_only))?;
        debug!(symbol = %name, exported_only, found = symbol.is_found(), "Global lookup");
        Ok(symbol)
    }

    fn find_symbol_in(
        &self,
        handle: ModuleSetHandle,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<JitSymbol, LayerError> {
        let id = self.native_id(handle)?;
        let symbol = self.read_symbol(|| self.engine.find_symbol_in(id, name, exported_only))?;
        debug!(%handle, symbol = %name, exported_only, found = symbol.is_found(), "Scoped lookup");
        Ok(symbol)
    }

    fn dispose(self) -> Result<(), LayerError> {
        let JitCompileLayer {
            engine,
            data_layout: _,
            registry,
            cleanups,
            metrics: _,
        } = self;

        let resident = registry
            .into_inner()
            .map(|registry| registry.len())
            .unwrap_or_default();
        let engine_result = engine.dispose();
        let cleaned = cleanups.run_all();

        info!(resident, cleanups = cleaned, "Disposed compile layer");
        engine_result.map_err(LayerError::from)
    }
}
