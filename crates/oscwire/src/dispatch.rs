//! Routing of incoming messages to registered listeners.

use crate::responses::Response;
use rosc::{OscMessage, OscType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Handle returned by [`Dispatcher::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Matches a message by address and an ordered prefix of its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub address: String,
    pub args: Vec<OscType>,
}

impl Pattern {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OscType>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn matches(&self, message: &OscMessage) -> bool {
        message.addr == self.address
            && self.args.len() <= message.args.len()
            && self.args.iter().zip(&message.args).all(|(want, got)| want == got)
    }
}

/// What a listener receives: the raw message, or its parsed form when the
/// listener asked for parsing.
#[derive(Debug, Clone)]
pub enum Incoming {
    Raw(OscMessage),
    Parsed(Response),
}

pub type Callback = Arc<dyn Fn(Incoming) + Send + Sync>;

struct Listener {
    id: ListenerId,
    pattern: Pattern,
    once: bool,
    parse_response: bool,
    callback: Callback,
}

/// Listener registry shared by every transport implementation.
#[derive(Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        pattern: Pattern,
        once: bool,
        parse_response: bool,
        callback: Callback,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(Listener {
            id,
            pattern,
            once,
            parse_response,
            callback,
        });
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver `message` to every matching listener. Once-listeners are
    /// dropped from the registry before any callback runs.
    pub fn dispatch(&self, message: &OscMessage) {
        let matched: Vec<(bool, Callback)> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            let matched = listeners
                .iter()
                .filter(|listener| listener.pattern.matches(message))
                .map(|listener| (listener.parse_response, Arc::clone(&listener.callback)))
                .collect();
            listeners.retain(|listener| !(listener.once && listener.pattern.matches(message)));
            matched
        };

        if matched.is_empty() {
            debug!(addr = %message.addr, "no listener for message");
            return;
        }

        let mut parsed: Option<Response> = None;
        for (parse_response, callback) in matched {
            if !parse_response {
                callback(Incoming::Raw(message.clone()));
                continue;
            }
            if parsed.is_none() {
                match Response::from_message(message) {
                    Ok(response) => parsed = Some(response),
                    Err(e) => {
                        warn!(addr = %message.addr, error = %e, "dropping unparseable reply");
                        continue;
                    }
                }
            }
            if let Some(response) = parsed.clone() {
                callback(Incoming::Parsed(response));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn synced(id: i32) -> OscMessage {
        OscMessage {
            addr: "/synced".to_string(),
            args: vec![OscType::Int(id)],
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let callback: Callback = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    #[test]
    fn pattern_matches_argument_prefix() {
        let pattern = Pattern::new("/synced").with_arg(7);
        assert!(pattern.matches(&synced(7)));
        assert!(!pattern.matches(&synced(8)));
        assert!(Pattern::new("/synced").matches(&synced(8)));
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let dispatcher = Dispatcher::new();
        let (hits, callback) = counter();
        dispatcher.register(Pattern::new("/synced"), true, false, callback);

        dispatcher.dispatch(&synced(1));
        dispatcher.dispatch(&synced(2));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn persistent_listener_until_unregistered() {
        let dispatcher = Dispatcher::new();
        let (hits, callback) = counter();
        let id = dispatcher.register(Pattern::new("/synced"), false, true, callback);

        dispatcher.dispatch(&synced(1));
        dispatcher.dispatch(&synced(2));
        assert!(dispatcher.unregister(id));
        dispatcher.dispatch(&synced(3));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!dispatcher.unregister(id));
    }

    #[test]
    fn callback_may_register_without_deadlock() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.register(
            Pattern::new("/synced"),
            true,
            false,
            Arc::new(move |_| {
                inner.register(Pattern::new("/done"), true, false, Arc::new(|_| {}));
            }),
        );
        dispatcher.dispatch(&synced(1));
        assert_eq!(dispatcher.listener_count(), 1);
    }
}
