use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::network::Connection;
use crate::{AppError, AppResult};

/// Everything a handler needs: the decoded body slice plus the connection
/// reference sufficient to reply on the same connection.
pub struct HandlerContext<'a> {
    pub connection: &'a Arc<Connection>,
    pub message_id: u16,
    pub send_timestamp: i64,
    pub body: &'a [u8],
}

impl HandlerContext<'_> {
    /// Replies on the connection the message arrived on.
    pub fn reply(&self, message_id: u16, body: &[u8]) -> AppResult<()> {
        self.connection.send(message_id, body)
    }
}

/// Application handler for one message id.
///
/// Handlers are invoked synchronously on the receive path; anything slow
/// should hand off to its own task or an outbound worker queue.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, ctx: &HandlerContext<'_>) -> AppResult<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&HandlerContext<'_>) -> AppResult<()> + Send + Sync,
{
    fn handle(&self, ctx: &HandlerContext<'_>) -> AppResult<()> {
        self(ctx)
    }
}

/// Maps message ids to handlers.
///
/// The registry is populated before the engine starts accepting and is
/// immutable afterwards; it is an explicitly constructed instance handed to
/// the engine, never process-global state.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: HashMap<u16, Box<dyn MessageHandler>>,
}

impl DispatchRegistry {
    pub fn new() -> DispatchRegistry {
        DispatchRegistry {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `message_id`.
    ///
    /// A second registration for the same id is a no-op: overwriting a live
    /// handler silently would hide wiring mistakes, so the duplicate is
    /// logged and the first registration kept.
    pub fn register<H>(&mut self, message_id: u16, handler: H)
    where
        H: MessageHandler + 'static,
    {
        if self.handlers.contains_key(&message_id) {
            warn!(
                "handler for message id {} already registered, ignoring duplicate",
                message_id
            );
            return;
        }
        self.handlers.insert(message_id, Box::new(handler));
    }

    pub fn is_registered(&self, message_id: u16) -> bool {
        self.handlers.contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Looks up and invokes the handler for the frame in `ctx`.
    ///
    /// An unknown id is reported as an error; whether that closes the
    /// connection is the caller's policy, since unknown ids may be tolerable
    /// during version skew.
    pub fn dispatch(&self, ctx: &HandlerContext<'_>) -> AppResult<()> {
        trace!(
            "dispatching message {} ({} byte body) from connection {}",
            ctx.message_id,
            ctx.body.len(),
            ctx.connection.id()
        );
        match self.handlers.get(&ctx.message_id) {
            Some(handler) => handler.handle(ctx),
            None => Err(AppError::UnknownMessageId(ctx.message_id)),
        }
    }
}

impl std::fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("handlers", &self.handlers.keys())
            .finish()
    }
}
