//! Cranelift-backed native engine
//!
//! Each module set is compiled into its own `JITModule`, so removing a set
//! frees exactly that set's code. Functions are compiled and relocated at
//! registration, which fixes their addresses for the life of the set. An
//! undefined import becomes a stub that calls through a pointer-sized cell;
//! materialization asks the set's resolver for each import and fills the
//! cells, either right away or, with lazy materialization, on the first
//! lookup that needs a symbol from the set. Resolution runs on whichever
//! thread performs that lookup and holds no engine lock, so resolvers may
//! look symbols up in other sets, including sets that import from theirs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

use cranelift_codegen::ir::{
    AbiParam, Function, InstBuilder, MemFlags, Signature, TrapCode, Type, UserFuncName,
};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module as _};
use tracing::{debug, info};

use super::buffer::{BufferPool, BufferPoolStats, NativeBuffer, DEFAULT_BUFFER_CAPACITY};
use super::data_layout::DataLayout;
use super::module::{FunctionDef, ImportDecl, ModuleScope, NativeModule, Visibility};
use super::NativeEngine;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ffi::{NativeModuleSetHandle, NativeResolver};
use crate::symbol::{JitSymbol, MangledSymbol, SymbolFlags};

/// Raised by an import stub called before its cell was filled.
const UNRESOLVED_IMPORT_TRAP: TrapCode = TrapCode::unwrap_user(1);

/// Owns the executable memory of one module set.
struct CodeMemory(Option<JITModule>);

// SAFETY: the JITModule is only touched while the set is being built and when
// it is dropped, never concurrently. The finalized code it owns is immutable.
unsafe impl Send for CodeMemory {}

impl CodeMemory {
    fn module_mut(&mut self) -> Option<&mut JITModule> {
        self.0.as_mut()
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        if let Some(module) = self.0.take() {
            // SAFETY: the set is no longer registered; callers were told its
            // addresses are invalid once it is removed.
            unsafe { module.free_memory() };
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SymbolEntry {
    address: u64,
    flags: SymbolFlags,
}

/// The cell an import stub calls through.
struct ImportCell {
    name: MangledSymbol,
    /// Address of a pointer-aligned, writable word in the set's data memory.
    cell: usize,
}

impl ImportCell {
    fn bind(&self, address: u64) {
        // SAFETY: `cell` points into data memory owned by the same set entry as
        // `self`, aligned to the pointer size and never freed before the entry.
        let cell = unsafe { AtomicUsize::from_ptr(self.cell as *mut usize) };
        cell.store(address as usize, Ordering::Release);
    }
}

struct ModuleSetEntry {
    handle: NativeModuleSetHandle,
    label: String,
    symbols: HashMap<MangledSymbol, SymbolEntry>,
    imports: Vec<ImportCell>,
    resolver: NativeResolver,
    materialized: AtomicBool,
    /// Threads currently resolving this set's imports.
    materializers: Mutex<HashSet<ThreadId>>,
    _code: Mutex<CodeMemory>,
}

/// Marks the current thread as materializing a set until dropped.
struct MaterializingGuard<'a> {
    set: &'a ModuleSetEntry,
    thread: ThreadId,
}

impl<'a> MaterializingGuard<'a> {
    /// `None` if this thread is already materializing `set`.
    fn enter(set: &'a ModuleSetEntry) -> Option<Self> {
        let thread = thread::current().id();
        let mut threads = set.materializers.lock().unwrap_or_else(|e| e.into_inner());
        threads.insert(thread).then(|| Self { set, thread })
    }
}

impl Drop for MaterializingGuard<'_> {
    fn drop(&mut self) {
        self.set
            .materializers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.thread);
    }
}

/// An undefined import, compiled as a stub calling through a data cell.
struct ImportStub {
    decl: ImportDecl,
    mangled: MangledSymbol,
    func_id: FuncId,
    data_id: DataId,
}

/// A module set compiled and relocated into its `JITModule`.
struct Compiled {
    symbols: HashMap<MangledSymbol, SymbolEntry>,
    imports: Vec<ImportCell>,
}

/// A [`NativeEngine`] that compiles module sets with Cranelift for the host.
pub struct JitEngine {
    config: EngineConfig,
    isa: OwnedTargetIsa,
    sets: RwLock<BTreeMap<NativeModuleSetHandle, Arc<ModuleSetEntry>>>,
    next_handle: AtomicU64,
    buffers: BufferPool,
}

impl JitEngine {
    /// Create an engine targeting the host ISA.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let isa_err = |e: &dyn std::fmt::Display| EngineError::Isa(e.to_string());

        let mut flag_builder = settings::builder();
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| isa_err(&e))?;
        flag_builder.set("is_pic", "false").map_err(|e| isa_err(&e))?;
        flag_builder
            .set("opt_level", config.opt_level.as_setting())
            .map_err(|e| isa_err(&e))?;
        flag_builder
            .set("enable_verifier", if config.verify_ir { "true" } else { "false" })
            .map_err(|e| isa_err(&e))?;

        let isa_builder = cranelift_native::builder().map_err(|e| isa_err(&e))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| isa_err(&e))?;

        info!(
            isa = %isa.triple(),
            opt_level = config.opt_level.as_setting(),
            lazy = config.lazy_materialization,
            "Created JIT engine"
        );

        Ok(Self {
            config,
            isa,
            sets: RwLock::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            buffers: BufferPool::new(DEFAULT_BUFFER_CAPACITY),
        })
    }

    /// Engine with default settings for the host.
    pub fn host() -> Result<Self, EngineError> {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Statistics of the buffers handed out by this engine.
    pub fn buffer_stats(&self) -> BufferPoolStats {
        self.buffers.get_stats()
    }

    /// Number of module sets currently resident.
    pub fn module_set_count(&self) -> usize {
        self.sets.read().map(|sets| sets.len()).unwrap_or(0)
    }

    /// `true` once every undefined import of the set has been resolved.
    pub fn is_materialized(&self, id: NativeModuleSetHandle) -> Result<bool, EngineError> {
        Ok(self.entry(id)?.materialized.load(Ordering::Acquire))
    }

    fn entry(&self, id: NativeModuleSetHandle) -> Result<Arc<ModuleSetEntry>, EngineError> {
        self.sets
            .read()
            .map_err(|_| EngineError::Poisoned("module set table"))?
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownModuleSet(id))
    }

    /// Resident sets in registration order. The table lock is released before
    /// any set is materialized so resolvers may register or remove sets.
    fn snapshot(&self) -> Result<Vec<Arc<ModuleSetEntry>>, EngineError> {
        Ok(self
            .sets
            .read()
            .map_err(|_| EngineError::Poisoned("module set table"))?
            .values()
            .cloned()
            .collect())
    }

    fn signature(&self, jit: &JITModule, params: &[Type], returns: &[Type]) -> Signature {
        let mut sig = jit.make_signature();
        sig.params.extend(params.iter().map(|ty| AbiParam::new(*ty)));
        sig.returns.extend(returns.iter().map(|ty| AbiParam::new(*ty)));
        sig
    }

    /// Declare, compile and relocate every function of the set.
    fn compile_set(
        &self,
        jit: &mut JITModule,
        label: &str,
        layout: &DataLayout,
        modules: Vec<NativeModule>,
    ) -> Result<Compiled, EngineError> {
        let mut ids = HashMap::new();
        let mut defined = Vec::new();
        let mut defined_names = HashSet::new();

        // Definitions first, so an import of the same name merges into them.
        for module in &modules {
            for def in &module.functions {
                let sig = self.signature(jit, &def.params, &def.returns);
                let (linkage, flags) = match def.visibility {
                    Visibility::Exported => {
                        (Linkage::Export, SymbolFlags::EXPORTED | SymbolFlags::CALLABLE)
                    }
                    Visibility::Internal => (Linkage::Local, SymbolFlags::CALLABLE),
                };
                let func_id = jit
                    .declare_function(&def.name, linkage, &sig)
                    .map_err(|e| EngineError::module(&module.name, e))?;
                ids.insert(def.name.clone(), func_id);
                defined_names.insert(def.name.clone());
                defined.push((MangledSymbol::from(layout.mangle(&def.name)), func_id, flags));
            }
        }

        let mut stubs: Vec<ImportStub> = Vec::new();
        for module in &modules {
            for import in &module.imports {
                let sig = self.signature(jit, &import.params, &import.returns);
                if defined_names.contains(&import.name) {
                    // Checks the signature against the definition.
                    jit.declare_function(&import.name, Linkage::Import, &sig)
                        .map_err(|e| EngineError::module(&module.name, e))?;
                    continue;
                }
                if let Some(stub) = stubs.iter().find(|s| s.decl.name == import.name) {
                    if stub.decl != *import {
                        return Err(EngineError::module(
                            &module.name,
                            format!("incompatible signature for import '{}'", import.name),
                        ));
                    }
                    continue;
                }
                let func_id = jit
                    .declare_anonymous_function(&sig)
                    .map_err(|e| EngineError::module(&module.name, e))?;
                let data_id = jit
                    .declare_anonymous_data(true, false)
                    .map_err(|e| EngineError::module(&module.name, e))?;
                let mut cell = DataDescription::new();
                let width = self.isa.pointer_bytes();
                cell.define_zeroinit(usize::from(width));
                cell.set_align(u64::from(width));
                jit.define_data(data_id, &cell)
                    .map_err(|e| EngineError::module(&module.name, e))?;
                ids.insert(import.name.clone(), func_id);
                stubs.push(ImportStub {
                    decl: import.clone(),
                    mangled: MangledSymbol::from(layout.mangle(&import.name)),
                    func_id,
                    data_id,
                });
            }
        }

        let mut fn_ctx = FunctionBuilderContext::new();
        for module in modules {
            for def in module.functions {
                let func_id = *ids
                    .get(&def.name)
                    .ok_or_else(|| EngineError::UndeclaredSymbol(def.name.clone()))?;
                self.compile_function(jit, &ids, &mut fn_ctx, &module.name, func_id, def)?;
            }
        }
        for stub in &stubs {
            self.compile_import_stub(jit, &mut fn_ctx, stub)?;
        }

        jit.finalize_definitions()
            .map_err(|e| EngineError::module(label, e))?;

        let symbols = defined
            .into_iter()
            .map(|(name, func_id, flags)| {
                let address = jit.get_finalized_function(func_id) as u64;
                (name, SymbolEntry { address, flags })
            })
            .collect();
        let imports = stubs
            .into_iter()
            .map(|stub| ImportCell {
                name: stub.mangled,
                cell: jit.get_finalized_data(stub.data_id).0 as usize,
            })
            .collect();
        Ok(Compiled { symbols, imports })
    }

    fn compile_function(
        &self,
        jit: &mut JITModule,
        ids: &HashMap<String, FuncId>,
        fn_ctx: &mut FunctionBuilderContext,
        module_name: &str,
        func_id: FuncId,
        def: FunctionDef,
    ) -> Result<(), EngineError> {
        let sig = self.signature(jit, &def.params, &def.returns);
        let mut func = Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
        {
            let mut builder = FunctionBuilder::new(&mut func, fn_ctx);
            let mut scope = ModuleScope::new(&mut *jit, ids);
            (def.body)(&mut builder, &mut scope)?;
            builder.finalize();
        }

        let mut ctx = Context::for_function(func);
        jit.define_function(func_id, &mut ctx)
            .map_err(|e| EngineError::module(module_name, format!("{}: {e}", def.name)))?;
        jit.clear_context(&mut ctx);
        debug!(module = module_name, function = %def.name, "Compiled function");
        Ok(())
    }

    /// Emit `load cell; trapz; call_indirect` with the import's signature.
    fn compile_import_stub(
        &self,
        jit: &mut JITModule,
        fn_ctx: &mut FunctionBuilderContext,
        stub: &ImportStub,
    ) -> Result<(), EngineError> {
        let sig = self.signature(jit, &stub.decl.params, &stub.decl.returns);
        let ptr_ty = self.isa.pointer_type();
        let mut func =
            Function::with_name_signature(UserFuncName::user(0, stub.func_id.as_u32()), sig.clone());
        {
            let mut b = FunctionBuilder::new(&mut func, fn_ctx);
            let entry = b.create_block();
            b.append_block_params_for_function_params(entry);
            b.switch_to_block(entry);
            b.seal_block(entry);

            let slot = jit.declare_data_in_func(stub.data_id, b.func);
            let cell = b.ins().global_value(ptr_ty, slot);
            let target = b.ins().load(ptr_ty, MemFlags::trusted(), cell, 0);
            b.ins().trapz(target, UNRESOLVED_IMPORT_TRAP);
            let sig_ref = b.import_signature(sig);
            let args = b.block_params(entry).to_vec();
            let call = b.ins().call_indirect(sig_ref, target, &args);
            let results = b.inst_results(call).to_vec();
            b.ins().return_(&results);
            b.finalize();
        }

        let mut ctx = Context::for_function(func);
        jit.define_function(stub.func_id, &mut ctx)
            .map_err(|e| EngineError::module(&stub.decl.name, e))?;
        jit.clear_context(&mut ctx);
        Ok(())
    }

    /// Resolve the set's imports unless that already happened. A set this
    /// thread is already materializing is left to the outer call, which fills
    /// its cells before any of its code can be reached.
    fn ensure_materialized(&self, set: &ModuleSetEntry) -> Result<(), EngineError> {
        if set.materialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(_guard) = MaterializingGuard::enter(set) else {
            debug!(handle = set.handle, "Re-entrant lookup into materializing set");
            return Ok(());
        };
        self.materialize(set)
    }

    fn materialize(&self, set: &ModuleSetEntry) -> Result<(), EngineError> {
        let start = Instant::now();
        for import in &set.imports {
            let symbol = JitSymbol::from_raw(set.resolver.resolve_bytes(import.name.as_bytes()));
            let address = symbol
                .address()
                .ok_or_else(|| EngineError::UnresolvedSymbol(import.name.to_string()))?;
            import.bind(address);
        }

        if !set.materialized.swap(true, Ordering::AcqRel) {
            info!(
                handle = set.handle,
                modules = %set.label,
                resolved = set.imports.len(),
                elapsed_us = start.elapsed().as_micros() as u64,
                "Module set materialized"
            );
        }
        Ok(())
    }

    fn lookup_in(
        &self,
        set: &ModuleSetEntry,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<JitSymbol, EngineError> {
        let Some(entry) = set.symbols.get(name) else {
            return Ok(JitSymbol::NotFound);
        };
        if exported_only && !entry.flags.is_exported() {
            return Ok(JitSymbol::NotFound);
        }
        self.ensure_materialized(set)?;
        Ok(JitSymbol::found(entry.address, entry.flags))
    }

    fn symbol_buffer(&self, symbol: JitSymbol) -> NativeBuffer {
        let mut buffer = self.buffers.acquire();
        symbol.into_raw().encode_into(&mut buffer);
        buffer
    }
}

impl NativeEngine for JitEngine {
    type ModuleSetId = NativeModuleSetHandle;

    fn get_mangled_symbol(
        &self,
        raw_name: &str,
        layout: &DataLayout,
    ) -> Result<NativeBuffer, EngineError> {
        let mut buffer = self.buffers.acquire();
        buffer.write(&layout.mangle(raw_name));
        Ok(buffer)
    }

    fn dispose_mangled_symbol(&self, buffer: NativeBuffer) {
        self.buffers.release(buffer);
    }

    fn find_symbol(
        &self,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<NativeBuffer, EngineError> {
        for set in self.snapshot()? {
            let symbol = self.lookup_in(&set, name, exported_only)?;
            if symbol.is_found() {
                return Ok(self.symbol_buffer(symbol));
            }
        }
        Ok(self.symbol_buffer(JitSymbol::NotFound))
    }

    fn find_symbol_in(
        &self,
        id: NativeModuleSetHandle,
        name: &MangledSymbol,
        exported_only: bool,
    ) -> Result<NativeBuffer, EngineError> {
        let set = self.entry(id)?;
        let symbol = self.lookup_in(&set, name, exported_only)?;
        Ok(self.symbol_buffer(symbol))
    }

    fn dispose_symbol(&self, buffer: NativeBuffer) {
        self.buffers.release(buffer);
    }

    fn add_module_set(
        &self,
        layout: &DataLayout,
        modules: Vec<NativeModule>,
        resolver: NativeResolver,
    ) -> Result<NativeModuleSetHandle, EngineError> {
        let start = Instant::now();
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let label = modules
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let builder =
            JITBuilder::with_isa(self.isa.clone(), cranelift_module::default_libcall_names());
        let mut code = CodeMemory(Some(JITModule::new(builder)));
        let compiled = match code.module_mut() {
            Some(jit) => self.compile_set(jit, &label, layout, modules)?,
            None => return Err(EngineError::UnknownModuleSet(handle)),
        };

        let entry = Arc::new(ModuleSetEntry {
            handle,
            label,
            symbols: compiled.symbols,
            imports: compiled.imports,
            resolver,
            materialized: AtomicBool::new(false),
            materializers: Mutex::new(HashSet::new()),
            _code: Mutex::new(code),
        });

        if !self.config.lazy_materialization {
            self.ensure_materialized(&entry)?;
        }

        info!(
            handle,
            modules = %entry.label,
            symbols = entry.symbols.len(),
            undefined = entry.imports.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Module set added"
        );
        self.sets
            .write()
            .map_err(|_| EngineError::Poisoned("module set table"))?
            .insert(handle, entry);
        Ok(handle)
    }

    fn remove_module_set(&self, id: NativeModuleSetHandle) -> Result<(), EngineError> {
        let entry = self
            .sets
            .write()
            .map_err(|_| EngineError::Poisoned("module set table"))?
            .remove(&id)
            .ok_or(EngineError::UnknownModuleSet(id))?;
        info!(handle = id, modules = %entry.label, "Module set removed");
        // Code memory is freed when the last in-flight lookup lets go of the entry.
        Ok(())
    }

    fn dispose(self) -> Result<(), EngineError> {
        let sets = self
            .sets
            .into_inner()
            .map_err(|_| EngineError::Poisoned("module set table"))?;
        info!(resident = sets.len(), "Disposing JIT engine");
        drop(sets);
        Ok(())
    }
}
