// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message dispatch: a `MessageType -> handler` table with uniform signature.

use std::collections::HashMap;

use crate::{Envelope, MessageType};

/// Uniform handler signature: `(state, envelope, sender) -> reply_or_none`.
pub type HandlerFn<S> =
    Box<dyn Fn(&mut S, &Envelope, Option<&str>) -> Option<Envelope> + Send + Sync>;

/// A dispatch table mapping message types to handlers over shared state `S`.
///
/// Both protocol ends build one of these: the client for inbound
/// reconciliation, the server for extension message types registered on top
/// of its built-in handlers (`custom`, compendium lookups).
///
/// # Examples
///
/// ```
/// use tavern_protocol::{Envelope, MessageType, Router};
///
/// let mut router: Router<u32> = Router::new();
/// router.register(MessageType::Ping, |hits, _env, _sender| {
///     *hits += 1;
///     Some(Envelope::pong())
/// });
///
/// let mut hits = 0;
/// let reply = router.dispatch(&mut hits, &Envelope::new(MessageType::Ping), None);
/// assert_eq!(hits, 1);
/// assert_eq!(reply.unwrap().kind, MessageType::Pong);
/// ```
pub struct Router<S> {
    handlers: HashMap<MessageType, HandlerFn<S>>,
}

impl<S> Default for Router<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Router<S> {
    /// Create an empty dispatch table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: MessageType, handler: F)
    where
        F: Fn(&mut S, &Envelope, Option<&str>) -> Option<Envelope> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Remove the handler for `kind`, returning whether one was present.
    pub fn unregister(&mut self, kind: MessageType) -> bool {
        self.handlers.remove(&kind).is_some()
    }

    /// Whether a handler is registered for `kind`.
    pub fn handles(&self, kind: MessageType) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Dispatch `envelope` to its handler, if any.
    ///
    /// Returns `None` both when no handler is registered and when the
    /// handler produced no reply; use [`Router::handles`] first when the
    /// distinction matters.
    pub fn dispatch(
        &self,
        state: &mut S,
        envelope: &Envelope,
        sender: Option<&str>,
    ) -> Option<Envelope> {
        self.handlers
            .get(&envelope.kind)
            .and_then(|h| h(state, envelope, sender))
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The message types this router handles, in arbitrary order.
    pub fn registered_types(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.handlers.keys().copied()
    }
}

impl<S> std::fmt::Debug for Router<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
