//! Compiled-module input
//!
//! A [`Module`] is a unit of code produced outside this crate: a list of
//! function definitions expressed as Cranelift IR emitters, plus the
//! undefined functions those bodies call. Registering a module moves it into
//! the engine, so a module can never be registered or read twice.
//!
//! ```compile_fail
//! # use std::sync::Arc;
//! # use jitlayer_core::{CompileLayer, JitCompileLayer, LayerConfig, Module};
//! # use jitlayer_core::resolver::{resolver_fn, SymbolResolver};
//! # use jitlayer_core::JitSymbol;
//! let layer = JitCompileLayer::from_config(&LayerConfig::default()).unwrap();
//! let resolver: Arc<dyn SymbolResolver> = Arc::new(resolver_fn(|_| JitSymbol::NotFound));
//! let module = Module::new("m");
//! layer.add_module_set(vec![module], resolver.clone()).unwrap();
//! // `module` was consumed by registration.
//! layer.add_module_set(vec![module], resolver).unwrap();
//! ```

use std::collections::HashMap;

use cranelift_codegen::ir::{FuncRef, Function};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module as _};
use tracing::debug;

use crate::error::EngineError;

pub use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Type};
pub use cranelift_frontend::FunctionBuilder;

/// Emits the IR of one function. The builder's function already carries the
/// declared signature; the body creates its own blocks.
pub type FunctionBody = Box<
    dyn FnOnce(&mut FunctionBuilder<'_>, &mut ModuleScope<'_>) -> Result<(), EngineError> + Send,
>;

/// Linkage of a defined function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Visible to lookups with `exported_only` set. Other module sets reach it
    /// only through their own resolver, typically one that looks it up on the layer.
    Exported,
    /// Only visible to lookups that include internal symbols.
    Internal,
}

/// An undefined function a module expects someone else to provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecl {
    pub name: String,
    pub params: Vec<Type>,
    pub returns: Vec<Type>,
}

pub struct FunctionDef {
    pub name: String,
    pub visibility: Visibility,
    pub params: Vec<Type>,
    pub returns: Vec<Type>,
    pub body: FunctionBody,
}

impl std::fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// A module in the form the engine consumes.
#[derive(Debug)]
pub struct NativeModule {
    pub name: String,
    pub imports: Vec<ImportDecl>,
    pub functions: Vec<FunctionDef>,
}

/// A compiled unit awaiting registration.
///
/// Deliberately neither `Clone` nor `Copy`.
#[derive(Debug)]
pub struct Module {
    name: String,
    imports: Vec<ImportDecl>,
    functions: Vec<FunctionDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a function this module calls but does not define.
    pub fn import_function(
        &mut self,
        name: impl Into<String>,
        params: &[Type],
        returns: &[Type],
    ) -> &mut Self {
        self.imports.push(ImportDecl {
            name: name.into(),
            params: params.to_vec(),
            returns: returns.to_vec(),
        });
        self
    }

    /// Define a function whose IR is emitted by `body` at registration.
    pub fn define_function<F>(
        &mut self,
        name: impl Into<String>,
        visibility: Visibility,
        params: &[Type],
        returns: &[Type],
        body: F,
    ) -> &mut Self
    where
        F: FnOnce(&mut FunctionBuilder<'_>, &mut ModuleScope<'_>) -> Result<(), EngineError>
            + Send
            + 'static,
    {
        self.functions.push(FunctionDef {
            name: name.into(),
            visibility,
            params: params.to_vec(),
            returns: returns.to_vec(),
            body: Box::new(body),
        });
        self
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }

    pub fn import_names(&self) -> impl Iterator<Item = &str> {
        self.imports.iter().map(|i| i.name.as_str())
    }

    /// Read the module into native form. The managed module is gone afterwards.
    pub fn into_native(self) -> NativeModule {
        debug!(
            module = %self.name,
            functions = self.functions.len(),
            imports = self.imports.len(),
            "Reading module into native form"
        );
        NativeModule {
            name: self.name,
            imports: self.imports,
            functions: self.functions,
        }
    }
}

/// Gives a function body access to the other functions of its module set.
pub struct ModuleScope<'m> {
    jit: &'m mut JITModule,
    ids: &'m HashMap<String, FuncId>,
}

impl<'m> ModuleScope<'m> {
    pub(crate) fn new(jit: &'m mut JITModule, ids: &'m HashMap<String, FuncId>) -> Self {
        Self { jit, ids }
    }

    /// Reference `name` (defined or imported anywhere in the module set) from
    /// the function being built. Pass `builder.func`.
    pub fn func_ref(&mut self, name: &str, func: &mut Function) -> Result<FuncRef, EngineError> {
        let id = self
            .ids
            .get(name)
            .ok_or_else(|| EngineError::UndeclaredSymbol(name.to_string()))?;
        Ok(self.jit.declare_func_in_func(*id, func))
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.ids.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_records_declarations() {
        let mut module = Module::new("math");
        module
            .import_function("host_log", &[types::I64], &[])
            .define_function("square", Visibility::Exported, &[types::I64], &[types::I64], |_, _| Ok(()))
            .define_function("helper", Visibility::Internal, &[], &[], |_, _| Ok(()));

        assert_eq!(module.name(), "math");
        assert_eq!(module.function_names().collect::<Vec<_>>(), ["square", "helper"]);
        assert_eq!(module.import_names().collect::<Vec<_>>(), ["host_log"]);
    }

    #[test]
    fn test_into_native_keeps_definitions() {
        let mut module = Module::new("m");
        module.define_function("f", Visibility::Internal, &[], &[types::I32], |_, _| Ok(()));

        let native = module.into_native();
        assert_eq!(native.name, "m");
        assert_eq!(native.functions.len(), 1);
        assert_eq!(native.functions[0].visibility, Visibility::Internal);
        assert_eq!(native.functions[0].returns, vec![types::I32]);
    }
}
