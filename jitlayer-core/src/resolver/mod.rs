//! Symbol resolvers
//!
//! A [`SymbolResolver`] answers the undefined symbols of a module set. The
//! engine may call it lazily, from whichever thread triggers materialization,
//! and possibly more than once for the same name, so implementations must be
//! thread-safe and should be idempotent.

pub mod adapter;
pub mod service;

pub use adapter::{adapt, ResolverContext};
pub use service::{spawn_resolver_service, AsyncSymbolResolver, ChannelResolver};

use std::sync::Arc;

use crate::symbol::{JitSymbol, MangledSymbol};

/// Caller-supplied resolution of a module set's undefined symbols.
///
/// A panic inside [`resolve`](SymbolResolver::resolve) does not unwind into
/// the engine. It is logged, counted in the layer metrics, and treated as
/// [`JitSymbol::NotFound`], so the lookup that triggered materialization
/// fails with [`EngineError::UnresolvedSymbol`](crate::EngineError::UnresolvedSymbol).
pub trait SymbolResolver: Send + Sync {
    /// Resolve a mangled name. Returning [`JitSymbol::NotFound`] is normal.
    fn resolve(&self, name: &MangledSymbol) -> JitSymbol;
}

impl<R: SymbolResolver + ?Sized> SymbolResolver for Arc<R> {
    fn resolve(&self, name: &MangledSymbol) -> JitSymbol {
        (**self).resolve(name)
    }
}

impl<R: SymbolResolver + ?Sized> SymbolResolver for Box<R> {
    fn resolve(&self, name: &MangledSymbol) -> JitSymbol {
        (**self).resolve(name)
    }
}

/// A resolver backed by a closure. See [`resolver_fn`].
pub struct FnResolver<F>(F);

impl<F> SymbolResolver for FnResolver<F>
where
    F: Fn(&MangledSymbol) -> JitSymbol + Send + Sync,
{
    fn resolve(&self, name: &MangledSymbol) -> JitSymbol {
        (self.0)(name)
    }
}

/// Wrap a closure as a [`SymbolResolver`].
///
/// ```
/// use jitlayer_core::resolver::{resolver_fn, SymbolResolver};
/// use jitlayer_core::{JitSymbol, MangledSymbol};
///
/// let resolver = resolver_fn(|name| {
///     if name.as_bytes() == b"bar" {
///         JitSymbol::absolute(0x1000)
///     } else {
///         JitSymbol::NotFound
///     }
/// });
/// assert!(resolver.resolve(&MangledSymbol::from_bytes(b"bar")).is_found());
/// ```
pub fn resolver_fn<F>(f: F) -> FnResolver<F>
where
    F: Fn(&MangledSymbol) -> JitSymbol + Send + Sync,
{
    FnResolver(f)
}

/// Resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResolver;

impl SymbolResolver for NullResolver {
    fn resolve(&self, _name: &MangledSymbol) -> JitSymbol {
        JitSymbol::NotFound
    }
}

/// Tries each resolver in order and returns the first hit.
#[derive(Default)]
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn SymbolResolver>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl SymbolResolver for ChainResolver {
    fn resolve(&self, name: &MangledSymbol) -> JitSymbol {
        self.resolvers
            .iter()
            .map(|r| r.resolve(name))
            .find(JitSymbol::is_found)
            .unwrap_or(JitSymbol::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> MangledSymbol {
        MangledSymbol::from_bytes(s.as_bytes())
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = resolver_fn(|n| {
            if n.as_bytes() == b"x" {
                JitSymbol::absolute(8)
            } else {
                JitSymbol::NotFound
            }
        });
        assert_eq!(resolver.resolve(&name("x")).address(), Some(8));
        assert!(!resolver.resolve(&name("y")).is_found());
    }

    #[test]
    fn test_shared_resolver_forwards() {
        let shared: Arc<dyn SymbolResolver> = Arc::new(resolver_fn(|_| JitSymbol::absolute(4)));
        let boxed: Box<dyn SymbolResolver> = Box::new(Arc::clone(&shared));
        assert!(shared.resolve(&name("a")).is_found());
        assert!(boxed.resolve(&name("a")).is_found());
    }

    #[test]
    fn test_chain_returns_first_hit() {
        let chain = ChainResolver::new()
            .with(Arc::new(NullResolver))
            .with(Arc::new(resolver_fn(|n| {
                if n.as_bytes() == b"b" {
                    JitSymbol::absolute(2)
                } else {
                    JitSymbol::NotFound
                }
            })))
            .with(Arc::new(resolver_fn(|_| JitSymbol::absolute(3))));

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.resolve(&name("b")).address(), Some(2));
        assert_eq!(chain.resolve(&name("c")).address(), Some(3));
        assert!(!ChainResolver::new().resolve(&name("b")).is_found());
    }
}
