use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::PayloadError;
use crate::Error;

/// A keyed fan-out table: the central dispatch primitive behind every
/// repeating reply stream in the session (progressive `RESULT`s, `EVENT`s,
/// `INVOCATION`s). Realized as a single `HashMap` guarded by the session's
/// one driver task rather than a general reactive subject — concurrent
/// access never happens, so no lock is needed here.
///
/// At most one consumer may be registered per key; registering a second
/// consumer for a key already in use silently replaces the first, whose
/// stream then ends (see DESIGN.md for why this is acceptable here).
pub struct Demux<K, V> {
    routes: HashMap<K, mpsc::UnboundedSender<V>>,
}

impl<K, V> Demux<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Demux<K, V> {
        Demux {
            routes: HashMap::new(),
        }
    }

    /// Registers a fresh consumer for `key`, returning the stream it will
    /// receive dispatched items on.
    pub fn register(&mut self, key: K) -> UnboundedReceiverStream<V> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(key, tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Delivers `value` to the consumer registered for `key`, if any.
    /// Unmatched items are dropped with a warning, never buffered.
    pub fn dispatch(&mut self, key: &K, value: V) {
        match self.routes.get(key) {
            Some(sender) => {
                if sender.send(value).is_err() {
                    warn!("demux: consumer for {:?} dropped its receiver", key);
                    self.routes.remove(key);
                }
            }
            None => warn!("demux: no consumer registered for key {:?}, dropping item", key),
        }
    }

    /// Releases the route for `key`, ending that consumer's stream.
    pub fn remove(&mut self, key: &K) {
        self.routes.remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.routes.contains_key(key)
    }
}

impl<K, T> Demux<K, Result<T, PayloadError>>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    /// Fans a terminal session failure out to every active consumer, then
    /// clears the table so any re-entrant teardown triggered by a consumer
    /// dropping its stream is a no-op.
    pub fn fail_all(&mut self, cause: Arc<Error>) {
        let routes = std::mem::take(&mut self.routes);
        for (_, sender) in routes {
            let _ = sender.send(Err(PayloadError::Session(cause.clone())));
        }
    }
}

impl<K, V> Default for Demux<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Demux::new()
    }
}
