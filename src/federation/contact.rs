//! Known-peer bookkeeping for the federation.
//!
//! Contacts are pure data; RPCs to a contact go through the transport's
//! client stub rather than through methods on the contact itself.

use std::net::{IpAddr, SocketAddr};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::domain::NodeId;

/// A peer node: identifier plus UDP endpoint.
///
/// Contacts are value-equal by node id alone; a peer that rebinds its
/// endpoint is still the same contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub address: IpAddr,
    pub port: u16,
}

impl Contact {
    #[must_use]
    pub fn new(id: NodeId, address: IpAddr, port: u16) -> Self {
        Self { id, address, port }
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

/// Set of live peers. Dead contacts are removed as soon as an RPC to them
/// times out.
#[derive(Debug, Default)]
pub struct ContactRegistry {
    contacts: DashMap<NodeId, Contact>,
}

impl ContactRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a contact; idempotent by node id. The newest endpoint wins.
    pub fn add(&self, contact: Contact) {
        self.contacts.insert(contact.id, contact);
    }

    /// Removes a contact silently.
    pub fn remove(&self, id: NodeId) {
        self.contacts.remove(&id);
    }

    #[must_use]
    pub fn find(&self, id: NodeId) -> Option<Contact> {
        self.contacts.get(&id).map(|entry| entry.clone())
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.contacts.contains_key(&id)
    }

    /// Snapshot of all known contacts, used for the shutdown broadcast.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Contact> {
        self.contacts.iter().map(|entry| entry.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
