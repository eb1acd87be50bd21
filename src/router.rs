use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::Result as UsherResult;

/// Registering two handlers under one name is a programming error caught
/// at startup, not something to recover from at runtime.
#[derive(Error, Debug)]
#[error("command '{0}' is already registered")]
pub struct DuplicateCommandError(pub String);

/// What a handler needs from the platform it was invoked on: a way to
/// answer the sender. Everything else (permissions, guild ids, sender
/// identity) lives on the concrete context type the adapter supplies.
#[async_trait]
pub trait CommandContext: Send + Sync + 'static {
    async fn reply(&self, text: &str);
}

type Handler<C> =
    Box<dyn Fn(Arc<C>, Vec<String>) -> BoxFuture<'static, UsherResult<()>> + Send + Sync>;

/// Prefix-based command router, one instance per platform.
///
/// The map is populated once at startup and never mutated afterwards;
/// adapters spawn `dispatch` per inbound message so handlers complete
/// independently and possibly out of order. The router knows nothing
/// about permissions — each handler checks its caller itself.
pub struct CommandRouter<C: CommandContext> {
    prefix: String,
    commands: HashMap<String, Handler<C>>,
    fallback: Option<Handler<C>>,
}

impl<C: CommandContext> CommandRouter<C> {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            commands: HashMap::new(),
            fallback: None,
        }
    }

    /// Register a handler under a command name.
    pub fn register<F>(&mut self, name: &str, handler: F) -> Result<(), DuplicateCommandError>
    where
        F: Fn(Arc<C>, Vec<String>) -> BoxFuture<'static, UsherResult<()>> + Send + Sync + 'static,
    {
        if self.commands.contains_key(name) {
            return Err(DuplicateCommandError(name.to_string()));
        }
        debug!(command = name, "Command registered");
        self.commands.insert(name.to_string(), Box::new(handler));
        Ok(())
    }

    /// Handler for messages that carry the prefix but no registered
    /// command name. It receives the unmatched name as the first argument.
    /// The streaming side uses this for the `@user` invite form.
    pub fn set_fallback<F>(&mut self, handler: F)
    where
        F: Fn(Arc<C>, Vec<String>) -> BoxFuture<'static, UsherResult<()>> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(handler));
    }

    /// Route one inbound message. Messages not starting with the prefix
    /// are ordinary chat and silently ignored. Handler errors become a
    /// user-facing reply plus a log entry; they never escape this method.
    pub async fn dispatch(&self, raw: &str, ctx: Arc<C>) {
        let mut tokens = raw.split_whitespace();
        match tokens.next() {
            Some(first) if first == self.prefix => {}
            _ => return,
        }

        let name = match tokens.next() {
            Some(name) => name,
            None => {
                ctx.reply("no command provided.").await;
                return;
            }
        };
        let args: Vec<String> = tokens.map(str::to_string).collect();

        let outcome = match self.commands.get(name) {
            Some(handler) => handler(ctx.clone(), args).await,
            None => match &self.fallback {
                Some(fallback) => {
                    let mut fallback_args = Vec::with_capacity(args.len() + 1);
                    fallback_args.push(name.to_string());
                    fallback_args.extend(args);
                    fallback(ctx.clone(), fallback_args).await
                }
                None => {
                    ctx.reply(&format!("there is no command {name}!")).await;
                    return;
                }
            },
        };

        if let Err(err) = outcome {
            if err.is_internal() {
                error!(command = name, error = %err, "Command failed");
            } else {
                warn!(command = name, error = %err, "Command rejected");
            }
            ctx.reply(&err.user_message()).await;
        }
    }
}
