use crate::dispatcher::JobTicket;
use crate::types::{Tile, TileKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Per-request completion callback, called once with the tile and whether
/// loading succeeded.
pub type Listener = Box<dyn FnOnce(&Tile, bool) + Send + Sync>;

/// A pending load and everyone waiting on it.
pub struct LoadJob {
    ticket: JobTicket,
    listeners: Vec<Listener>,
}

pub enum Registration {
    /// First request for this key: the caller must start the load.
    Started(JobTicket),
    /// A load is already pending; the listener (if any) was attached to it.
    Joined,
}

/// Request coalescing to deduplicate concurrent requests for the same tile
pub struct InFlight {
    in_flight: DashMap<TileKey, LoadJob>,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Registers interest in `key`.
    ///
    /// The check and the insert happen under the same shard lock, so of any
    /// number of concurrent callers exactly one gets `Started`.
    pub fn register(&self, key: TileKey, listener: Option<Listener>) -> Registration {
        match self.in_flight.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(listener) = listener {
                    entry.get_mut().listeners.push(listener);
                }
                Registration::Joined
            }
            Entry::Vacant(entry) => {
                let ticket = JobTicket::new();
                entry.insert(LoadJob {
                    ticket: ticket.clone(),
                    listeners: listener.into_iter().collect(),
                });
                Registration::Started(ticket)
            }
        }
    }

    /// Removes the pending load for `key` and hands back its listeners.
    ///
    /// `None` when the key is unknown or now belongs to a different load,
    /// i.e. the completion arrived after a cancellation.
    pub fn complete(&self, key: &TileKey, ticket: &JobTicket) -> Option<Vec<Listener>> {
        self.in_flight
            .remove_if(key, |_, job| job.ticket.same_as(ticket))
            .map(|(_, job)| job.listeners)
    }

    /// Forgets every load that has not started and detaches the listeners of
    /// those that have.
    ///
    /// Started loads keep their key so a later request joins them instead of
    /// issuing a second fetch. Returns the number of loads forgotten.
    pub fn cancel_all(&self) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, job| {
            if job.ticket.cancel() {
                false
            } else {
                job.listeners.clear();
                true
            }
        });
        before.saturating_sub(self.in_flight.len())
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}
