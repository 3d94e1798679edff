//! Fan-out of sample arrivals to live subscribers.
//!
//! The router maps a [`SubscriptionKey`] to the channels of every live
//! subscription interested in it. The map lock is held only to look up or
//! mutate entries; delivery happens on a snapshot taken under the lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// `(<directory>.<archive>.<field>, identifier)`; the identifier is the
/// on-disk (encoded) form and absent for plugins without per-instance
/// directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub metric: String,
    pub identifier: Option<String>,
}

impl SubscriptionKey {
    pub fn new(metric: impl Into<String>, identifier: Option<String>) -> Self {
        Self {
            metric: metric.into(),
            identifier,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(ident) => write!(f, "{}[{}]", self.metric, ident),
            None => f.write_str(&self.metric),
        }
    }
}

/// Notification that samples for `key` arrived at `timestamps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub key: SubscriptionKey,
    pub timestamps: Vec<i64>,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of a subscriber's arrival queue.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    tx: mpsc::UnboundedSender<Arrival>,
}

impl Channel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arrival>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Candidate keys for a metric path `<host>.<segment>.<type>[.<field>]`.
///
/// The segment is tried whole (no identifier) and split at every `-` into
/// `<directory>-<identifier>`; a path with no field component uses
/// `value`. Returns nothing for paths that cannot name an archive.
pub fn candidate_keys(path: &str) -> Vec<SubscriptionKey> {
    let Some((_host, rest)) = path.split_once('.') else {
        return Vec::new();
    };
    let Some((segment, series)) = rest.split_once('.') else {
        return Vec::new();
    };
    if segment.is_empty() || series.is_empty() {
        return Vec::new();
    }
    let series = match series.rsplit_once('.') {
        Some((archive, field)) if !archive.is_empty() && !field.is_empty() => {
            format!("{archive}.{field}")
        }
        Some(_) => return Vec::new(),
        None => format!("{series}.value"),
    };

    let mut keys = vec![SubscriptionKey::new(format!("{segment}.{series}"), None)];
    for (i, _) in segment.match_indices('-') {
        let (directory, identifier) = (&segment[..i], &segment[i + 1..]);
        if directory.is_empty() || identifier.is_empty() {
            continue;
        }
        keys.push(SubscriptionKey::new(
            format!("{directory}.{series}"),
            Some(identifier.to_string()),
        ));
    }
    keys
}

type Subscribers = HashMap<u64, mpsc::UnboundedSender<Arrival>>;

/// Key to subscriber channel map.
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    routes: Mutex<HashMap<SubscriptionKey, Subscribers>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Subscribers>> {
        // Entries are only inserted or removed whole; a panicked holder
        // cannot leave the map half-updated.
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `channel` to `key`. Subscribing twice is a no-op.
    pub fn subscribe(&self, key: SubscriptionKey, channel: &Channel) {
        trace!(key = %key, channel = channel.id, "subscribe");
        self.routes()
            .entry(key)
            .or_default()
            .entry(channel.id)
            .or_insert_with(|| channel.tx.clone());
    }

    /// Removes `channel` from `key`, dropping the key once nobody listens.
    /// Removing an absent channel is a no-op.
    pub fn unsubscribe(&self, key: &SubscriptionKey, channel: &Channel) {
        trace!(key = %key, channel = channel.id, "unsubscribe");
        let mut routes = self.routes();
        if let Some(subscribers) = routes.get_mut(key) {
            subscribers.remove(&channel.id);
            if subscribers.is_empty() {
                routes.remove(key);
            }
        }
    }

    /// Delivers an arrival to every channel subscribed to `key` right now.
    /// Returns the number of channels it was delivered to.
    pub fn publish(&self, key: &SubscriptionKey, timestamps: Vec<i64>) -> usize {
        let snapshot: Vec<mpsc::UnboundedSender<Arrival>> = match self.routes().get(key) {
            Some(subscribers) => subscribers.values().cloned().collect(),
            None => return 0,
        };

        let arrival = Arrival {
            key: key.clone(),
            timestamps,
        };
        let mut delivered = 0;
        for tx in snapshot {
            if tx.send(arrival.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(key = %key, "subscriber went away before delivery");
            }
        }
        delivered
    }

    /// Registered keys a sample with this metric path maps to.
    pub fn keys_for_sample(&self, path: &str) -> Vec<SubscriptionKey> {
        let candidates = candidate_keys(path);
        if candidates.is_empty() {
            return candidates;
        }
        let routes = self.routes();
        candidates
            .into_iter()
            .filter(|key| routes.contains_key(key))
            .collect()
    }

    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.routes().get(key).map_or(0, HashMap::len)
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey, channel: &Channel) -> bool {
        self.routes()
            .get(key)
            .is_some_and(|subscribers| subscribers.contains_key(&channel.id))
    }

    /// Number of keys with at least one subscriber.
    pub fn key_count(&self) -> usize {
        self.routes().len()
    }
}
