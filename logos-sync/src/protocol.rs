//! Binary wire protocol for room log synchronization.
//!
//! Every message is `[message type: varint][type-specific payload]`. Strings and
//! byte blobs are length-prefixed: `[length: varint][raw bytes]`. Varints are
//! unsigned LEB128, at most 10 bytes.
//!
//! ```text
//! ┌────────────┬───────────────────────────────────────────────────────────┐
//! │ type       │ fields                                                    │
//! ├────────────┼───────────────────────────────────────────────────────────┤
//! │ 0 Update   │ confirmation-or-offset, room, payload                     │
//! │ 1 Sub      │ confirmation, count, count × (room, offset, epoch)        │
//! │ 2 Conf     │ number                                                    │
//! │ 3 SubConf  │ count, count × (room, corrected offset, epoch)            │
//! │ 4 HostUnc  │ client confirmation echo, new offset                      │
//! │ 5 ConfHost │ room, durable offset                                      │
//! └────────────┴───────────────────────────────────────────────────────────┘
//! ```
//!
//! One transport frame may carry several messages back to back. [`Decoder`]
//! pulls them off the frame one at a time.

use std::fmt;

use thiserror::Error;

/// Longest valid varint encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Longest room name accepted on the wire (room names are file names).
pub const MAX_ROOM_NAME_LEN: usize = 255;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Room data, client → server or server → client
    Update = 0,
    /// Subscription request
    Subscribe = 1,
    /// Cumulative confirmation number
    Confirmation = 2,
    /// Subscription reply with corrected offsets
    SubscribeConfirm = 3,
    /// Optimistic acknowledgement of an accepted update
    HostUnconfirmedByClient = 4,
    /// Durable offset notification
    ConfirmedByHost = 5,
}

impl MessageType {
    /// Map a decoded tag to a message type.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Update),
            1 => Some(Self::Subscribe),
            2 => Some(Self::Confirmation),
            3 => Some(Self::SubscribeConfirm),
            4 => Some(Self::HostUnconfirmedByClient),
            5 => Some(Self::ConfirmedByHost),
            _ => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame ended in the middle of a field
    #[error("truncated frame: needed {needed} more bytes at offset {at}")]
    Truncated { at: usize, needed: usize },
    /// Varint longer than 10 bytes or overflowing u64
    #[error("varint overflow at offset {at}")]
    VarintOverflow { at: usize },
    /// Length prefix does not fit in memory
    #[error("length prefix {0} too large")]
    LengthOverflow(u64),
    /// Room name rejected
    #[error("invalid room name {name:?}: {reason}")]
    InvalidRoomName { name: String, reason: &'static str },
}

/// Validated room name.
///
/// Room names double as file names under the storage root, so path
/// separators, NUL and the dot entries are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomName(String);

impl RoomName {
    /// Validate and wrap a room name.
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("empty")
        } else if name.len() > MAX_ROOM_NAME_LEN {
            Some("too long")
        } else if name == "." || name == ".." {
            Some("reserved")
        } else if name.contains(['/', '\\', '\0']) {
            Some("contains a path separator or NUL")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ProtocolError::InvalidRoomName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque room-state generation token.
///
/// A client that reports an epoch different from the room's is forced into
/// a full resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Draw a fresh random epoch.
    pub fn generate() -> Self {
        Self(u64::from(rand::random::<u32>()))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// One `(room, offset, epoch)` triple of a Subscribe or SubscribeConfirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub room: RoomName,
    pub offset: u64,
    pub epoch: Epoch,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Room data. From a client the number is the client confirmation; from
    /// the server it is a server confirmation the client must acknowledge.
    Update {
        confirmation: u64,
        room: RoomName,
        payload: Vec<u8>,
    },
    Subscribe {
        confirmation: u64,
        entries: Vec<SubscriptionEntry>,
    },
    SubscribeConfirm {
        entries: Vec<SubscriptionEntry>,
    },
    Confirmation {
        number: u64,
    },
    HostUnconfirmedByClient {
        confirmation: u64,
        offset: u64,
    },
    ConfirmedByHost {
        room: RoomName,
        offset: u64,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Update { .. } => MessageType::Update,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::SubscribeConfirm { .. } => MessageType::SubscribeConfirm,
            Self::Confirmation { .. } => MessageType::Confirmation,
            Self::HostUnconfirmedByClient { .. } => MessageType::HostUnconfirmedByClient,
            Self::ConfirmedByHost { .. } => MessageType::ConfirmedByHost,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size_hint());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.message_type() as u64);
        match self {
            Self::Update {
                confirmation,
                room,
                payload,
            } => {
                write_varint(buf, *confirmation);
                write_bytes(buf, room.as_str().as_bytes());
                write_bytes(buf, payload);
            }
            Self::Subscribe {
                confirmation,
                entries,
            } => {
                write_varint(buf, *confirmation);
                write_entries(buf, entries);
            }
            Self::SubscribeConfirm { entries } => write_entries(buf, entries),
            Self::Confirmation { number } => write_varint(buf, *number),
            Self::HostUnconfirmedByClient {
                confirmation,
                offset,
            } => {
                write_varint(buf, *confirmation);
                write_varint(buf, *offset);
            }
            Self::ConfirmedByHost { room, offset } => {
                write_bytes(buf, room.as_str().as_bytes());
                write_varint(buf, *offset);
            }
        }
    }

    /// Decode every message in a frame.
    ///
    /// An unknown message type ends decoding early; the messages before it
    /// are returned.
    pub fn decode_frame(frame: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        let mut decoder = Decoder::new(frame);
        let mut messages = Vec::new();
        while let Some(message) = decoder.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn encoded_size_hint(&self) -> usize {
        match self {
            Self::Update { room, payload, .. } => 3 * MAX_VARINT_LEN + room.as_str().len() + payload.len(),
            Self::Subscribe { entries, .. } | Self::SubscribeConfirm { entries } => {
                3 * MAX_VARINT_LEN + entries.len() * (3 * MAX_VARINT_LEN + 16)
            }
            _ => 3 * MAX_VARINT_LEN + 16,
        }
    }
}

/// Encode an `Update` without taking ownership of the payload.
///
/// Broadcast paths encode the same payload once per subscriber, each with its
/// own confirmation number.
pub fn encode_update(confirmation: u64, room: &RoomName, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 * MAX_VARINT_LEN + room.as_str().len() + payload.len());
    write_varint(&mut buf, MessageType::Update as u64);
    write_varint(&mut buf, confirmation);
    write_bytes(&mut buf, room.as_str().as_bytes());
    write_bytes(&mut buf, payload);
    buf
}

fn write_entries(buf: &mut Vec<u8>, entries: &[SubscriptionEntry]) {
    write_varint(buf, entries.len() as u64);
    for entry in entries {
        write_bytes(buf, entry.room.as_str().as_bytes());
        write_varint(buf, entry.offset);
        write_varint(buf, entry.epoch.0);
    }
}

/// Append an unsigned LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut n: u64) {
    while n >= 0x80 {
        buf.push((n as u8) | 0x80);
        n >>= 7;
    }
    buf.push(n as u8);
}

/// Append a length-prefixed byte blob.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Pull-based cursor over one frame.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether unread bytes remain.
    pub fn has_content(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> Result<u64, ProtocolError> {
        let start = self.pos;
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(ProtocolError::Truncated { at: self.pos, needed: 1 });
            };
            self.pos += 1;
            let bits = u64::from(byte & 0x7f);
            // The tenth byte may only contribute the top bit of a u64.
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(ProtocolError::VarintOverflow { at: start });
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::VarintOverflow { at: start })
    }

    /// Read a length-prefixed byte blob, borrowing from the frame.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::LengthOverflow(len))?;
        if len > self.remaining() {
            return Err(ProtocolError::Truncated {
                at: self.pos,
                needed: len - self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_room_name(&mut self) -> Result<RoomName, ProtocolError> {
        let bytes = self.read_bytes()?;
        match std::str::from_utf8(bytes) {
            Ok(name) => RoomName::new(name),
            Err(_) => Err(ProtocolError::InvalidRoomName {
                name: String::from_utf8_lossy(bytes).into_owned(),
                reason: "not valid UTF-8",
            }),
        }
    }

    fn read_entries(&mut self) -> Result<Vec<SubscriptionEntry>, ProtocolError> {
        let count = self.read_varint()?;
        // Each entry takes at least three bytes; never trust the count for allocation.
        let mut entries = Vec::with_capacity((count as usize).min(self.remaining() / 3));
        for _ in 0..count {
            let room = self.read_room_name()?;
            let offset = self.read_varint()?;
            let epoch = Epoch(self.read_varint()?);
            entries.push(SubscriptionEntry { room, offset, epoch });
        }
        Ok(entries)
    }

    /// Decode the next message.
    ///
    /// Returns `Ok(None)` when the frame is exhausted, or when an unknown
    /// message type is met; the rest of the frame is skipped in that case.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        if !self.has_content() {
            return Ok(None);
        }
        let tag = self.read_varint()?;
        let Some(message_type) = MessageType::from_tag(tag) else {
            log::debug!(
                "Unknown message type {tag}, skipping {} remaining bytes of frame",
                self.remaining()
            );
            self.pos = self.buf.len();
            return Ok(None);
        };

        let message = match message_type {
            MessageType::Update => Message::Update {
                confirmation: self.read_varint()?,
                room: self.read_room_name()?,
                payload: self.read_bytes()?.to_vec(),
            },
            MessageType::Subscribe => Message::Subscribe {
                confirmation: self.read_varint()?,
                entries: self.read_entries()?,
            },
            MessageType::SubscribeConfirm => Message::SubscribeConfirm {
                entries: self.read_entries()?,
            },
            MessageType::Confirmation => Message::Confirmation {
                number: self.read_varint()?,
            },
            MessageType::HostUnconfirmedByClient => Message::HostUnconfirmedByClient {
                confirmation: self.read_varint()?,
                offset: self.read_varint()?,
            },
            MessageType::ConfirmedByHost => Message::ConfirmedByHost {
                room: self.read_room_name()?,
                offset: self.read_varint()?,
            },
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomName {
        RoomName::new(name).unwrap()
    }

    #[test]
    fn test_varint_known_encodings() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0);
        write_varint(&mut buf, 127);
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0x00, 0x7f, 0xac, 0x02]);

        let mut decoder = Decoder::new(&buf);
        assert_eq!(decoder.read_varint().unwrap(), 0);
        assert_eq!(decoder.read_varint().unwrap(), 127);
        assert_eq!(decoder.read_varint().unwrap(), 300);
        assert!(!decoder.has_content());
    }

    #[test]
    fn test_varint_u64_max() {
        let mut buf = Vec::new();
        write_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(Decoder::new(&buf).read_varint().unwrap(), u64::MAX);
    }

    #[test]
    fn test_varint_overflow_rejected() {
        let buf = [0xff; 11];
        assert_eq!(
            Decoder::new(&buf).read_varint(),
            Err(ProtocolError::VarintOverflow { at: 0 })
        );

        let mut too_big = vec![0xff; 9];
        too_big.push(0x02);
        assert!(matches!(
            Decoder::new(&too_big).read_varint(),
            Err(ProtocolError::VarintOverflow { .. })
        ));
    }

    #[test]
    fn test_update_exact_bytes() {
        let msg = Message::Update {
            confirmation: 7,
            room: room("doc1"),
            payload: vec![1, 2, 3],
        };
        assert_eq!(
            msg.encode(),
            vec![0, 7, 4, b'd', b'o', b'c', b'1', 3, 1, 2, 3]
        );
        assert_eq!(encode_update(7, &room("doc1"), &[1, 2, 3]), msg.encode());
    }

    #[test]
    fn test_subscribe_decode() {
        let msg = Message::Subscribe {
            confirmation: 2,
            entries: vec![
                SubscriptionEntry { room: room("a"), offset: 10, epoch: Epoch(99) },
                SubscriptionEntry { room: room("b"), offset: 0, epoch: Epoch(0) },
            ],
        };
        let decoded = Message::decode_frame(&msg.encode()).unwrap();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn test_multiple_messages_in_one_frame() {
        let mut frame = Vec::new();
        Message::Confirmation { number: 4 }.encode_into(&mut frame);
        Message::ConfirmedByHost { room: room("doc"), offset: 300 }.encode_into(&mut frame);
        Message::HostUnconfirmedByClient { confirmation: 1, offset: 2 }.encode_into(&mut frame);

        let decoded = Message::decode_frame(&frame).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], Message::Confirmation { number: 4 });
        assert_eq!(decoded[1].message_type(), MessageType::ConfirmedByHost);
        assert_eq!(decoded[2].message_type(), MessageType::HostUnconfirmedByClient);
    }

    #[test]
    fn test_unknown_type_skips_rest_of_frame() {
        let mut frame = Vec::new();
        Message::Confirmation { number: 1 }.encode_into(&mut frame);
        write_varint(&mut frame, 42);
        frame.extend_from_slice(&[9, 9, 9]);
        Message::Confirmation { number: 2 }.encode_into(&mut frame);

        let mut decoder = Decoder::new(&frame);
        assert_eq!(decoder.next_message().unwrap(), Some(Message::Confirmation { number: 1 }));
        assert_eq!(decoder.next_message().unwrap(), None);
        assert!(!decoder.has_content());
    }

    #[test]
    fn test_truncated_payload() {
        let msg = Message::Update {
            confirmation: 0,
            room: room("r"),
            payload: vec![5; 20],
        };
        let mut bytes = msg.encode();
        bytes.truncate(bytes.len() - 5);
        assert!(matches!(
            Message::decode_frame(&bytes),
            Err(ProtocolError::Truncated { needed: 5, .. })
        ));
    }

    #[test]
    fn test_huge_subscribe_count_does_not_allocate() {
        let mut frame = Vec::new();
        write_varint(&mut frame, MessageType::Subscribe as u64);
        write_varint(&mut frame, 0);
        write_varint(&mut frame, u64::MAX);
        assert!(matches!(
            Message::decode_frame(&frame),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_room_name_validation() {
        assert!(RoomName::new("doc-1.bin").is_ok());
        assert!(RoomName::new("").is_err());
        assert!(RoomName::new(".").is_err());
        assert!(RoomName::new("..").is_err());
        assert!(RoomName::new("a/b").is_err());
        assert!(RoomName::new("a\\b").is_err());
        assert!(RoomName::new("a\0b").is_err());
        assert!(RoomName::new("x".repeat(MAX_ROOM_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_invalid_room_name_on_wire() {
        let mut frame = Vec::new();
        write_varint(&mut frame, MessageType::ConfirmedByHost as u64);
        write_bytes(&mut frame, b"../etc");
        write_varint(&mut frame, 0);
        assert!(matches!(
            Message::decode_frame(&frame),
            Err(ProtocolError::InvalidRoomName { .. })
        ));

        let mut frame = Vec::new();
        write_varint(&mut frame, MessageType::ConfirmedByHost as u64);
        write_bytes(&mut frame, &[0xff, 0xfe]);
        write_varint(&mut frame, 0);
        assert!(matches!(
            Message::decode_frame(&frame),
            Err(ProtocolError::InvalidRoomName { reason: "not valid UTF-8", .. })
        ));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Update as u8, 0);
        assert_eq!(MessageType::Subscribe as u8, 1);
        assert_eq!(MessageType::Confirmation as u8, 2);
        assert_eq!(MessageType::SubscribeConfirm as u8, 3);
        assert_eq!(MessageType::HostUnconfirmedByClient as u8, 4);
        assert_eq!(MessageType::ConfirmedByHost as u8, 5);
        assert_eq!(MessageType::from_tag(6), None);
    }

    #[test]
    fn test_empty_frame() {
        assert!(Message::decode_frame(&[]).unwrap().is_empty());
    }
}
