//! Handler registry: canonical command name -> handler closure.
//!
//! Handlers are values keyed by name, registered explicitly at startup; there
//! is no inheritance hierarchy and no runtime type lookup. Each registration
//! may carry a [`CommandChain`] describing the successors to enqueue when the
//! command reaches a terminal state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use anvil_core::{CommandChain, CommandDefinition, Outcome};

/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

/// A registered handler: raw input blob plus the attempt's cancellation
/// token in, an [`Outcome`] out.
pub type Handler = Arc<dyn Fn(Option<String>, CancellationToken) -> HandlerFuture + Send + Sync>;

/// One registry entry: the handler and its successor rules.
pub struct Registration {
    handler: Handler,
    chain: CommandChain,
}

impl Registration {
    /// Invoke the handler with a raw input blob and the attempt's token.
    pub fn invoke(&self, input: Option<String>, token: CancellationToken) -> HandlerFuture {
        (self.handler.as_ref())(input, token)
    }

    pub fn chain(&self) -> &CommandChain {
        &self.chain
    }
}

/// Lookup from command name to handler, built once at startup.
///
/// The registry is the only piece the orchestrator treats as opaque: it never
/// inspects inputs or outputs, it only routes by name. Typed registration via
/// [`HandlerRegistry::register`] layers serde on top for applications that
/// want it; [`HandlerRegistry::register_raw`] takes the blob as-is.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler under an explicit name.
    pub fn register_raw<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Option<String>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register_raw_chained(name, CommandChain::new(), handler);
    }

    /// Register a raw handler together with its successor rules.
    pub fn register_raw_chained<F, Fut>(
        &mut self,
        name: impl Into<String>,
        chain: CommandChain,
        handler: F,
    ) where
        F: Fn(Option<String>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |input, token| Box::pin(handler(input, token)) as HandlerFuture);
        self.entries
            .insert(name.into(), Registration { handler, chain });
    }

    /// Register a typed handler under the command's canonical name.
    ///
    /// The input blob is deserialized into `C` before the handler runs; a
    /// missing blob deserializes as JSON `null`. A blob that does not parse
    /// counts as a failed attempt without invoking the handler.
    pub fn register<C, F, Fut>(&mut self, handler: F)
    where
        C: CommandDefinition,
        F: Fn(C, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register_chained(CommandChain::new(), handler);
    }

    /// Register a typed handler together with its successor rules.
    pub fn register_chained<C, F, Fut>(&mut self, chain: CommandChain, handler: F)
    where
        C: CommandDefinition,
        F: Fn(C, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let name = C::command_name();
        self.register_raw_chained(name, chain, move |input, token| {
            let handler = handler.clone();
            async move {
                let blob = input.as_deref().unwrap_or("null");
                match serde_json::from_str::<C>(blob) {
                    Ok(command) => (*handler)(command, token).await,
                    Err(e) => {
                        warn!(command = name, error = %e, "failed to deserialize command input");
                        Outcome::Failed
                    }
                }
            }
        });
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
