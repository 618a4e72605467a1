//! Tuple model for the replicated registry.
//!
//! Two tuple kinds are distinguished by their first field: lendable
//! `resource` tuples and advertised `handler` tuples. A tuple's identity is
//! the SHA-1 hash of its serialized field sequence; the original-publisher
//! id travels alongside as metadata so attribution survives claim/release
//! cycles.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ID_LEN, NodeId, ResourceKind, sha1_digest};

/// Errors raised by tuple serialization.
#[derive(Debug, Error)]
pub enum TupleError {
    #[error("tuple blob is not valid: {0}")]
    BadBlob(#[from] serde_json::Error),
}

/// Content hash identifying a stored tuple.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleKey([u8; ID_LEN]);

impl fmt::Debug for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TupleKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// A registry tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tuple {
    /// `("resource", resourceType, ownerId)` — lendable, taken exclusively.
    Resource { resource: ResourceKind, owner: NodeId },
    /// `("handler", "ivr", ownerId, channelFilter, callerIdFilter)`.
    /// Empty filter strings mean *any*.
    IvrHandler {
        owner: NodeId,
        channel_filter: String,
        caller_id_filter: String,
    },
    /// `("handler", "sms", ownerId)`.
    SmsHandler { owner: NodeId },
}

impl Tuple {
    #[must_use]
    pub fn resource(resource: ResourceKind, owner: NodeId) -> Self {
        Self::Resource { resource, owner }
    }

    #[must_use]
    pub fn ivr_handler(owner: NodeId, channel_filter: &str, caller_id_filter: &str) -> Self {
        Self::IvrHandler {
            owner,
            channel_filter: channel_filter.to_string(),
            caller_id_filter: caller_id_filter.to_string(),
        }
    }

    #[must_use]
    pub fn sms_handler(owner: NodeId) -> Self {
        Self::SmsHandler { owner }
    }

    /// The node the tuple points at (field three of every tuple kind).
    #[must_use]
    pub fn owner(&self) -> NodeId {
        match self {
            Self::Resource { owner, .. }
            | Self::IvrHandler { owner, .. }
            | Self::SmsHandler { owner } => *owner,
        }
    }

    /// Serializes the ordered field sequence into the opaque byte blob used
    /// for storage and replication.
    ///
    /// # Panics
    /// Never panics: the tuple variants always serialize.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("tuple serialization is infallible")
    }

    /// Parses a tuple back from its serialized blob.
    pub fn deserialize(blob: &[u8]) -> Result<Self, TupleError> {
        Ok(serde_json::from_slice(blob)?)
    }

    /// Storage identity: hash of the serialized payload. Equal-value tuples
    /// are indistinguishable.
    #[must_use]
    pub fn key(&self) -> TupleKey {
        TupleKey(sha1_digest(&self.serialize()))
    }
}

/// A lookup template: tuple fields with wildcard placeholders.
///
/// Matching is equality on non-wildcard fields. The filter fields of a
/// handler template are passed through lookups so callers can transport
/// filter patterns over the `findTuple` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TupleTemplate {
    Resource {
        resource: ResourceKind,
        owner: Option<NodeId>,
    },
    IvrHandler {
        owner: Option<NodeId>,
        channel_filter: Option<String>,
        caller_id_filter: Option<String>,
    },
    SmsHandler { owner: Option<NodeId> },
}

impl TupleTemplate {
    /// Template matching any resource tuple of the given kind.
    #[must_use]
    pub fn any_resource(resource: ResourceKind) -> Self {
        Self::Resource { resource, owner: None }
    }

    /// Template matching any IVR handler tuple.
    #[must_use]
    pub fn any_ivr_handler() -> Self {
        Self::IvrHandler {
            owner: None,
            channel_filter: None,
            caller_id_filter: None,
        }
    }

    /// Template matching any SMS handler tuple.
    #[must_use]
    pub fn any_sms_handler() -> Self {
        Self::SmsHandler { owner: None }
    }

    /// Fully binds a tuple into its exact-match template.
    #[must_use]
    pub fn exact(tuple: &Tuple) -> Self {
        match tuple {
            Tuple::Resource { resource, owner } => Self::Resource {
                resource: *resource,
                owner: Some(*owner),
            },
            Tuple::IvrHandler {
                owner,
                channel_filter,
                caller_id_filter,
            } => Self::IvrHandler {
                owner: Some(*owner),
                channel_filter: Some(channel_filter.clone()),
                caller_id_filter: Some(caller_id_filter.clone()),
            },
            Tuple::SmsHandler { owner } => Self::SmsHandler { owner: Some(*owner) },
        }
    }

    /// Whether every field is bound; fully bound templates are resolved by
    /// hashed lookup rather than a scan.
    #[must_use]
    pub fn is_fully_bound(&self) -> bool {
        match self {
            Self::Resource { owner, .. } => owner.is_some(),
            Self::IvrHandler {
                owner,
                channel_filter,
                caller_id_filter,
            } => owner.is_some() && channel_filter.is_some() && caller_id_filter.is_some(),
            Self::SmsHandler { owner } => owner.is_some(),
        }
    }

    /// The tuple this template denotes when fully bound.
    #[must_use]
    pub fn to_tuple(&self) -> Option<Tuple> {
        match self {
            Self::Resource {
                resource,
                owner: Some(owner),
            } => Some(Tuple::Resource {
                resource: *resource,
                owner: *owner,
            }),
            Self::IvrHandler {
                owner: Some(owner),
                channel_filter: Some(channel),
                caller_id_filter: Some(caller),
            } => Some(Tuple::IvrHandler {
                owner: *owner,
                channel_filter: channel.clone(),
                caller_id_filter: caller.clone(),
            }),
            Self::SmsHandler { owner: Some(owner) } => Some(Tuple::SmsHandler { owner: *owner }),
            _ => None,
        }
    }

    /// Equality on the bound fields.
    #[must_use]
    pub fn matches(&self, tuple: &Tuple) -> bool {
        match (self, tuple) {
            (
                Self::Resource { resource, owner },
                Tuple::Resource {
                    resource: t_resource,
                    owner: t_owner,
                },
            ) => resource == t_resource && owner.is_none_or(|id| id == *t_owner),
            (
                Self::IvrHandler {
                    owner,
                    channel_filter,
                    caller_id_filter,
                },
                Tuple::IvrHandler {
                    owner: t_owner,
                    channel_filter: t_channel,
                    caller_id_filter: t_caller,
                },
            ) => {
                owner.is_none_or(|id| id == *t_owner)
                    && channel_filter.as_ref().is_none_or(|f| f == t_channel)
                    && caller_id_filter.as_ref().is_none_or(|f| f == t_caller)
            }
            (Self::SmsHandler { owner }, Tuple::SmsHandler { owner: t_owner }) => {
                owner.is_none_or(|id| id == *t_owner)
            }
            _ => false,
        }
    }

    /// Echoes this template's bound field values into a result tuple,
    /// substituting the stored owner. This is the protocol by which filter
    /// patterns pass through a lookup.
    #[must_use]
    pub fn echo(&self, stored: &Tuple) -> Tuple {
        match (self, stored) {
            (
                Self::IvrHandler {
                    channel_filter,
                    caller_id_filter,
                    ..
                },
                Tuple::IvrHandler {
                    owner,
                    channel_filter: stored_channel,
                    caller_id_filter: stored_caller,
                },
            ) => Tuple::IvrHandler {
                owner: *owner,
                channel_filter: channel_filter.clone().unwrap_or_else(|| stored_channel.clone()),
                caller_id_filter: caller_id_filter
                    .clone()
                    .unwrap_or_else(|| stored_caller.clone()),
            },
            _ => stored.clone(),
        }
    }
}
