//! Async resolver service
//!
//! Engine threads resolve symbols synchronously, but some resolvers need to
//! await (a symbol server, a lazily built host library). The service runs an
//! [`AsyncSymbolResolver`] on a tokio runtime and hands out a
//! [`ChannelResolver`] that engine threads can block on.
//!
//! # Threading:
//! A `ChannelResolver` blocks the calling thread until the reply arrives, so
//! it must not be driven from a thread of the runtime that hosts the service
//! when that runtime is single-threaded.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::SymbolResolver;
use crate::symbol::{JitSymbol, MangledSymbol};

/// A resolver that may await while answering.
#[async_trait]
pub trait AsyncSymbolResolver: Send + Sync + 'static {
    async fn resolve(&self, name: &MangledSymbol) -> JitSymbol;
}

struct ResolveRequest {
    name: MangledSymbol,
    reply: std_mpsc::SyncSender<JitSymbol>,
}

/// Synchronous front end of a resolver service.
#[derive(Clone)]
pub struct ChannelResolver {
    requests: mpsc::UnboundedSender<ResolveRequest>,
}

impl ChannelResolver {
    /// `false` once the service has shut down.
    pub fn is_connected(&self) -> bool {
        !self.requests.is_closed()
    }
}

impl SymbolResolver for ChannelResolver {
    fn resolve(&self, name: &MangledSymbol) -> JitSymbol {
        let (reply, response) = std_mpsc::sync_channel(1);
        let request = ResolveRequest {
            name: name.clone(),
            reply,
        };
        if self.requests.send(request).is_err() {
            warn!(symbol = %name, "Resolver service is gone; reporting symbol as not found");
            return JitSymbol::NotFound;
        }
        response.recv().unwrap_or(JitSymbol::NotFound)
    }
}

/// Start serving `resolver` on the runtime behind `handle`.
///
/// The service runs until every clone of the returned [`ChannelResolver`] is
/// dropped or the runtime shuts down. Requests are answered concurrently.
pub fn spawn_resolver_service<R>(handle: &Handle, resolver: R) -> ChannelResolver
where
    R: AsyncSymbolResolver,
{
    let (requests, mut incoming) = mpsc::unbounded_channel::<ResolveRequest>();
    let resolver = Arc::new(resolver);

    handle.spawn(async move {
        debug!("Resolver service started");
        while let Some(request) = incoming.recv().await {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move {
                let symbol = resolver.resolve(&request.name).await;
                // The requester may have given up; nothing to do then.
                let _ = request.reply.send(symbol);
            });
        }
        debug!("Resolver service stopped");
    });

    ChannelResolver { requests }
}
