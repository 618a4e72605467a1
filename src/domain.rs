//! Core domain types shared across the federation, AGI and dialog layers.
//!
//! Identifiers on the wire are 160-bit opaque byte strings; everything else
//! is a validated newtype to keep raw primitives out of the public API.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use nutype::nutype;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Number of bytes in a 160-bit identifier.
pub const ID_LEN: usize = 20;

/// 160-bit pseudo-random node identifier, compared as opaque bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Generates a fresh identifier by hashing 256 random bits.
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self(sha1_digest(&seed))
    }

    /// Reconstructs an identifier from its raw wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

/// 160-bit message identifier, unique within the sender.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcId([u8; ID_LEN]);

impl RpcId {
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self(sha1_digest(&seed))
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId({self})")
    }
}

/// SHA-1 digest of arbitrary bytes, used for tuple identity and hashed
/// dialog-node names.
#[must_use]
pub fn sha1_digest(data: &[u8]) -> [u8; ID_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The two lendable telephony resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Outgoing-call gateway (also gates inbound concurrency per node).
    Ivr,
    /// Outgoing-SMS gateway.
    Sms,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ivr => "ivr",
            Self::Sms => "sms",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ivr" => Some(Self::Ivr),
            "sms" => Some(Self::Sms),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locally minted identifier binding a return AGI leg to the outbound dial
/// request (or inbound re-route) that caused it.
#[nutype(
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct HandlerId(String);

impl HandlerId {
    /// Mints a fresh handler id scoped to a channel or prefix.
    ///
    /// # Panics
    /// Never panics: the minted string is always non-empty.
    #[must_use]
    pub fn mint(prefix: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::try_new(format!("{prefix}:{}", &suffix[..12])).expect("minted id is non-empty")
    }
}

/// PBX-assigned unique identifier for one call leg.
#[nutype(
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct SessionId(String);

/// Net number of resources this node has taken from others.
///
/// Must drain back to zero before orderly shutdown.
#[derive(Debug, Default)]
pub struct ClaimedResources(AtomicUsize);

impl ClaimedResources {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        let previous = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "claimed-resource counter underflow");
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.current() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_160_bits_and_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.as_bytes().len(), ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn node_id_round_trips_through_bytes() {
        let id = NodeId::generate();
        let restored = NodeId::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, restored);
        assert!(NodeId::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn resource_kind_parses_its_wire_names() {
        assert_eq!(ResourceKind::parse("ivr"), Some(ResourceKind::Ivr));
        assert_eq!(ResourceKind::parse("sms"), Some(ResourceKind::Sms));
        assert_eq!(ResourceKind::parse("fax"), None);
        assert_eq!(ResourceKind::Ivr.as_str(), "ivr");
    }

    #[test]
    fn minted_handler_ids_carry_their_prefix() {
        let id = HandlerId::mint("incoming:SIP/100");
        assert!(id.as_ref().starts_with("incoming:SIP/100:"));
        assert_ne!(id, HandlerId::mint("incoming:SIP/100"));
    }

    #[test]
    fn claimed_resource_counter_drains() {
        let counter = ClaimedResources::new();
        assert!(counter.is_drained());
        counter.increment();
        counter.increment();
        assert_eq!(counter.current(), 2);
        counter.decrement();
        counter.decrement();
        assert!(counter.is_drained());
    }
}
