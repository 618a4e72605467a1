//! On-the-wire message format for the federation RPC fabric.
//!
//! Messages are built from a small self-describing primitive tree (integers,
//! byte strings, lists, maps) and bencoded for transmission. The header
//! schema uses *integer* map keys, which is why the codec is implemented
//! here rather than borrowed from a bencode crate.
//!
//! Oversize payloads are split into enumerated datagram slices sharing the
//! message id; [`Assembler`] buffers partial messages until complete.

use std::collections::BTreeMap;
use std::collections::HashMap;

use thiserror::Error;

use crate::domain::{ID_LEN, NodeId, RpcId};

/// Upper bound for a single UDP datagram. Larger messages are fragmented.
pub const DATAGRAM_BUDGET: usize = 8192;

/// Marker byte prefixed to fragment datagrams. A bencoded message always
/// starts with `d`, so the marker is unambiguous.
const FRAGMENT_MARKER: u8 = 0x00;

/// Fragment header: marker + u16 total + u16 sequence + 20-byte message id.
const FRAGMENT_HEADER_LEN: usize = 1 + 2 + 2 + ID_LEN;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of wire data")]
    Truncated,

    #[error("invalid wire data at byte {position}: {reason}")]
    Invalid { position: usize, reason: String },

    #[error("message header is missing field {field}")]
    MissingHeaderField { field: i64 },

    #[error("unknown message type {0}")]
    UnknownMessageType(i64),

    #[error("identifier field has wrong length")]
    BadIdentifier,

    #[error("fragment header is malformed")]
    BadFragment,
}

/// Key of a wire map: the header schema uses integers, application payloads
/// may use byte strings. Integer keys sort before byte-string keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WireKey {
    Int(i64),
    Bytes(Vec<u8>),
}

/// A node in the self-describing primitive tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<WireKey, WireValue>),
}

impl WireValue {
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_utf8(&self) -> Option<String> {
        match self {
            Self::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[WireValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Bencodes a primitive tree.
#[must_use]
pub fn encode(value: &WireValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &WireValue, out: &mut Vec<u8>) {
    match value {
        WireValue::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        WireValue::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        WireValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        WireValue::Map(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                match key {
                    WireKey::Int(i) => encode_into(&WireValue::Int(*i), out),
                    WireKey::Bytes(bytes) => encode_into(&WireValue::Bytes(bytes.clone()), out),
                }
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Decodes a bencoded primitive tree, rejecting trailing garbage.
pub fn decode(data: &[u8]) -> Result<WireValue, WireError> {
    let mut cursor = Cursor { data, position: 0 };
    let value = cursor.decode_value()?;
    if cursor.position != data.len() {
        return Err(WireError::Invalid {
            position: cursor.position,
            reason: "trailing bytes after message".into(),
        });
    }
    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, WireError> {
        self.data.get(self.position).copied().ok_or(WireError::Truncated)
    }

    fn bump(&mut self) -> Result<u8, WireError> {
        let byte = self.peek()?;
        self.position += 1;
        Ok(byte)
    }

    fn decode_value(&mut self) -> Result<WireValue, WireError> {
        match self.peek()? {
            b'i' => {
                self.position += 1;
                Ok(WireValue::Int(self.decode_int(b'e')?))
            }
            b'l' => {
                self.position += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.decode_value()?);
                }
                self.position += 1;
                Ok(WireValue::List(items))
            }
            b'd' => {
                self.position += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = match self.decode_value()? {
                        WireValue::Int(i) => WireKey::Int(i),
                        WireValue::Bytes(bytes) => WireKey::Bytes(bytes),
                        _ => {
                            return Err(WireError::Invalid {
                                position: self.position,
                                reason: "map key must be an int or byte string".into(),
                            });
                        }
                    };
                    entries.insert(key, self.decode_value()?);
                }
                self.position += 1;
                Ok(WireValue::Map(entries))
            }
            b'0'..=b'9' => {
                let length = self.decode_int(b':')?;
                let length = usize::try_from(length).map_err(|_| WireError::Invalid {
                    position: self.position,
                    reason: "negative byte-string length".into(),
                })?;
                if self.position + length > self.data.len() {
                    return Err(WireError::Truncated);
                }
                let bytes = self.data[self.position..self.position + length].to_vec();
                self.position += length;
                Ok(WireValue::Bytes(bytes))
            }
            other => Err(WireError::Invalid {
                position: self.position,
                reason: format!("unexpected byte {other:#04x}"),
            }),
        }
    }

    fn decode_int(&mut self, terminator: u8) -> Result<i64, WireError> {
        let start = self.position;
        let mut digits = String::new();
        loop {
            let byte = self.bump()?;
            if byte == terminator {
                break;
            }
            digits.push(byte as char);
        }
        digits.parse().map_err(|_| WireError::Invalid {
            position: start,
            reason: format!("invalid integer {digits:?}"),
        })
    }
}

// Header schema: fixed integer keys and message-type discriminants.
const HEADER_TYPE: i64 = 0;
const HEADER_MSG_ID: i64 = 1;
const HEADER_SENDER_ID: i64 = 2;
const HEADER_PAYLOAD: i64 = 3;
const HEADER_ARGS: i64 = 4;

const TYPE_REQUEST: i64 = 0;
const TYPE_RESPONSE: i64 = 1;
const TYPE_ERROR: i64 = 2;

/// A federation RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    Request {
        id: RpcId,
        sender: NodeId,
        method: String,
        args: Vec<WireValue>,
    },
    Response {
        id: RpcId,
        sender: NodeId,
        payload: WireValue,
    },
    Error {
        id: RpcId,
        sender: NodeId,
        exception: String,
        message: String,
    },
}

impl RpcMessage {
    #[must_use]
    pub fn id(&self) -> RpcId {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn sender(&self) -> NodeId {
        match self {
            Self::Request { sender, .. }
            | Self::Response { sender, .. }
            | Self::Error { sender, .. } => *sender,
        }
    }

    /// Lowers the message onto the primitive tree using the header schema.
    #[must_use]
    pub fn to_wire(&self) -> WireValue {
        let mut map = BTreeMap::new();
        map.insert(
            WireKey::Int(HEADER_MSG_ID),
            WireValue::Bytes(self.id().as_bytes().to_vec()),
        );
        map.insert(
            WireKey::Int(HEADER_SENDER_ID),
            WireValue::Bytes(self.sender().as_bytes().to_vec()),
        );
        match self {
            Self::Request { method, args, .. } => {
                map.insert(WireKey::Int(HEADER_TYPE), WireValue::Int(TYPE_REQUEST));
                map.insert(WireKey::Int(HEADER_PAYLOAD), WireValue::str(method));
                map.insert(WireKey::Int(HEADER_ARGS), WireValue::List(args.clone()));
            }
            Self::Response { payload, .. } => {
                map.insert(WireKey::Int(HEADER_TYPE), WireValue::Int(TYPE_RESPONSE));
                map.insert(WireKey::Int(HEADER_PAYLOAD), payload.clone());
            }
            Self::Error { exception, message, .. } => {
                map.insert(WireKey::Int(HEADER_TYPE), WireValue::Int(TYPE_ERROR));
                map.insert(WireKey::Int(HEADER_PAYLOAD), WireValue::str(exception));
                map.insert(WireKey::Int(HEADER_ARGS), WireValue::str(message));
            }
        }
        WireValue::Map(map)
    }

    /// Parses a message from the primitive tree.
    pub fn from_wire(value: &WireValue) -> Result<Self, WireError> {
        let WireValue::Map(map) = value else {
            return Err(WireError::Invalid {
                position: 0,
                reason: "message is not a map".into(),
            });
        };
        let field = |field: i64| {
            map.get(&WireKey::Int(field))
                .ok_or(WireError::MissingHeaderField { field })
        };
        let msg_type = field(HEADER_TYPE)?
            .as_int()
            .ok_or(WireError::MissingHeaderField { field: HEADER_TYPE })?;
        let id = RpcId::from_bytes(
            field(HEADER_MSG_ID)?.as_bytes().ok_or(WireError::BadIdentifier)?,
        )
        .ok_or(WireError::BadIdentifier)?;
        let sender = NodeId::from_bytes(
            field(HEADER_SENDER_ID)?.as_bytes().ok_or(WireError::BadIdentifier)?,
        )
        .ok_or(WireError::BadIdentifier)?;

        match msg_type {
            TYPE_REQUEST => {
                let method = field(HEADER_PAYLOAD)?
                    .as_utf8()
                    .ok_or(WireError::MissingHeaderField { field: HEADER_PAYLOAD })?;
                let args = match field(HEADER_ARGS)? {
                    WireValue::List(items) => items.clone(),
                    other => vec![other.clone()],
                };
                Ok(Self::Request { id, sender, method, args })
            }
            TYPE_RESPONSE => Ok(Self::Response {
                id,
                sender,
                payload: field(HEADER_PAYLOAD)?.clone(),
            }),
            TYPE_ERROR => Ok(Self::Error {
                id,
                sender,
                exception: field(HEADER_PAYLOAD)?.as_utf8().unwrap_or_default(),
                message: field(HEADER_ARGS)?.as_utf8().unwrap_or_default(),
            }),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Splits an encoded message into datagrams, fragmenting when it exceeds
/// the budget. Each fragment carries `marker | total | seq | msg id`.
#[must_use]
pub fn split_datagrams(id: RpcId, encoded: &[u8], budget: usize) -> Vec<Vec<u8>> {
    if encoded.len() <= budget {
        return vec![encoded.to_vec()];
    }
    let slice_len = budget - FRAGMENT_HEADER_LEN;
    let total = encoded.len().div_ceil(slice_len);
    let mut datagrams = Vec::with_capacity(total);
    for (seq, chunk) in encoded.chunks(slice_len).enumerate() {
        let mut datagram = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
        datagram.push(FRAGMENT_MARKER);
        datagram.extend_from_slice(&u16::try_from(total).unwrap_or(u16::MAX).to_be_bytes());
        datagram.extend_from_slice(&u16::try_from(seq).unwrap_or(u16::MAX).to_be_bytes());
        datagram.extend_from_slice(id.as_bytes());
        datagram.extend_from_slice(chunk);
        datagrams.push(datagram);
    }
    datagrams
}

/// Buffers incomplete fragment assemblies keyed by message id and delivers
/// the reassembled payload once every slice has arrived.
#[derive(Default)]
pub struct Assembler {
    partial: HashMap<RpcId, PartialMessage>,
}

struct PartialMessage {
    total: usize,
    slices: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl Assembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one datagram. Returns the full encoded message when complete,
    /// `None` while an assembly is still pending.
    pub fn feed(&mut self, datagram: &[u8]) -> Result<Option<Vec<u8>>, WireError> {
        if datagram.first() != Some(&FRAGMENT_MARKER) {
            return Ok(Some(datagram.to_vec()));
        }
        if datagram.len() <= FRAGMENT_HEADER_LEN {
            return Err(WireError::BadFragment);
        }
        let total = usize::from(u16::from_be_bytes([datagram[1], datagram[2]]));
        let seq = usize::from(u16::from_be_bytes([datagram[3], datagram[4]]));
        let id = RpcId::from_bytes(&datagram[5..5 + ID_LEN]).ok_or(WireError::BadFragment)?;
        if total == 0 || seq >= total {
            return Err(WireError::BadFragment);
        }

        let entry = self.partial.entry(id).or_insert_with(|| PartialMessage {
            total,
            slices: vec![None; total],
            received: 0,
        });
        if entry.total != total {
            // Peer restarted the transfer with a different slicing.
            *entry = PartialMessage {
                total,
                slices: vec![None; total],
                received: 0,
            };
        }
        if entry.slices[seq].is_none() {
            entry.slices[seq] = Some(datagram[FRAGMENT_HEADER_LEN..].to_vec());
            entry.received += 1;
        }
        if entry.received < entry.total {
            return Ok(None);
        }

        let entry = self.partial.remove(&id).expect("assembly present");
        let mut message = Vec::new();
        for slice in entry.slices {
            message.extend_from_slice(&slice.expect("all slices received"));
        }
        Ok(Some(message))
    }

    /// Drops any partial assembly for the given message id.
    pub fn forget(&mut self, id: RpcId) {
        self.partial.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_values() {
        let cases: Vec<(WireValue, &[u8])> = vec![
            (WireValue::Int(42), b"i42e"),
            (WireValue::str("spam"), b"4:spam"),
            (
                WireValue::List(vec![WireValue::str("spam"), WireValue::Int(42)]),
                b"l4:spami42ee",
            ),
            (
                WireValue::Map(BTreeMap::from([
                    (WireKey::Bytes(b"bar".to_vec()), WireValue::str("spam")),
                    (WireKey::Bytes(b"foo".to_vec()), WireValue::Int(42)),
                ])),
                b"d3:bar4:spam3:fooi42ee",
            ),
            (
                WireValue::List(vec![
                    WireValue::List(vec![
                        WireValue::str("abc"),
                        WireValue::str("127.0.0.1"),
                        WireValue::Int(1919),
                    ]),
                    WireValue::List(vec![
                        WireValue::str("def"),
                        WireValue::str("127.0.0.1"),
                        WireValue::Int(1921),
                    ]),
                ]),
                b"ll3:abc9:127.0.0.1i1919eel3:def9:127.0.0.1i1921eee",
            ),
        ];
        for (value, expected) in cases {
            assert_eq!(encode(&value), expected);
            assert_eq!(decode(expected).unwrap(), value);
        }
    }

    #[test]
    fn rejects_rubbish() {
        assert!(decode(b"abcdefghijklmnopqrstuvwxyz").is_err());
        assert!(decode(b"").is_err());
        assert!(decode(b"i42ei1e").is_err());
        assert!(decode(b"99:short").is_err());
    }

    #[test]
    fn integer_map_keys_round_trip() {
        let value = WireValue::Map(BTreeMap::from([
            (WireKey::Int(0), WireValue::Int(1)),
            (WireKey::Int(3), WireValue::str("payload")),
        ]));
        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn request_message_round_trips() {
        let message = RpcMessage::Request {
            id: RpcId::generate(),
            sender: NodeId::generate(),
            method: "getOwnedTuples".into(),
            args: vec![WireValue::Int(7), WireValue::str("x")],
        };
        let parsed = RpcMessage::from_wire(&decode(&encode(&message.to_wire())).unwrap()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn error_message_carries_exception_tag() {
        let message = RpcMessage::Error {
            id: RpcId::generate(),
            sender: NodeId::generate(),
            exception: "MethodNotExposed".into(),
            message: "no such rpc: frobnicate".into(),
        };
        let parsed = RpcMessage::from_wire(&decode(&encode(&message.to_wire())).unwrap()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut map = BTreeMap::new();
        map.insert(WireKey::Int(0), WireValue::Int(9));
        map.insert(
            WireKey::Int(1),
            WireValue::Bytes(RpcId::generate().as_bytes().to_vec()),
        );
        map.insert(
            WireKey::Int(2),
            WireValue::Bytes(NodeId::generate().as_bytes().to_vec()),
        );
        let err = RpcMessage::from_wire(&WireValue::Map(map)).unwrap_err();
        assert!(matches!(err, WireError::UnknownMessageType(9)));
    }

    #[test]
    fn small_messages_are_not_fragmented() {
        let id = RpcId::generate();
        let datagrams = split_datagrams(id, b"d0:0:e", DATAGRAM_BUDGET);
        assert_eq!(datagrams.len(), 1);
        let mut assembler = Assembler::new();
        assert_eq!(assembler.feed(&datagrams[0]).unwrap().unwrap(), b"d0:0:e");
    }

    #[test]
    fn large_messages_reassemble_out_of_order() {
        let id = RpcId::generate();
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let mut datagrams = split_datagrams(id, &payload, DATAGRAM_BUDGET);
        assert!(datagrams.len() > 1);
        datagrams.reverse();

        let mut assembler = Assembler::new();
        let mut delivered = None;
        for datagram in &datagrams {
            assert!(datagram.len() <= DATAGRAM_BUDGET);
            if let Some(message) = assembler.feed(datagram).unwrap() {
                delivered = Some(message);
            }
        }
        assert_eq!(delivered.unwrap(), payload);
    }

    #[test]
    fn duplicate_fragments_are_ignored() {
        let id = RpcId::generate();
        let payload = vec![7u8; DATAGRAM_BUDGET * 2];
        let datagrams = split_datagrams(id, &payload, DATAGRAM_BUDGET);
        let mut assembler = Assembler::new();
        assert!(assembler.feed(&datagrams[0]).unwrap().is_none());
        assert!(assembler.feed(&datagrams[0]).unwrap().is_none());
        let mut result = None;
        for datagram in &datagrams[1..] {
            if let Some(message) = assembler.feed(datagram).unwrap() {
                result = Some(message);
            }
        }
        assert_eq!(result.unwrap(), payload);
    }
}
