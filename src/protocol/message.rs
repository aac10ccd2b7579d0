use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::core::identifier::{Contact, KadId, ID_BYTES};
use crate::core::storage::{Content, GetParameter};

/// Hard cap on a datagram, both directions.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Encode/decode faults. Decode faults are logged and dropped at the
/// transport seam; encode faults surface to the caller of send.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown message code {0:#04x}")]
    UnknownCode(u8),
    #[error("datagram truncated")]
    Truncated,
    #[error("datagram of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap")]
    Oversized(usize),
    #[error("invalid utf-8 in {0} field")]
    InvalidText(&'static str),
}

/// One-byte tag opening every datagram. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageCode {
    ConnectRequest = 0x01,
    ConnectReply = 0x02,
    NodeLookupRequest = 0x03,
    NodeReply = 0x04,
    StoreRequest = 0x05,
    ContentLookupRequest = 0x06,
    ContentReply = 0x07,
}

impl TryFrom<u8> for MessageCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageCode::ConnectRequest),
            0x02 => Ok(MessageCode::ConnectReply),
            0x03 => Ok(MessageCode::NodeLookupRequest),
            0x04 => Ok(MessageCode::NodeReply),
            0x05 => Ok(MessageCode::StoreRequest),
            0x06 => Ok(MessageCode::ContentLookupRequest),
            0x07 => Ok(MessageCode::ContentReply),
            other => Err(WireError::UnknownCode(other)),
        }
    }
}

/// A decoded datagram body. Every variant carries the origin contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectRequest {
        origin: Contact,
    },
    ConnectReply {
        origin: Contact,
    },
    NodeLookupRequest {
        origin: Contact,
        target: KadId,
    },
    NodeReply {
        origin: Contact,
        nodes: Vec<Contact>,
    },
    StoreRequest {
        origin: Contact,
        content: Content,
    },
    ContentLookupRequest {
        origin: Contact,
        params: GetParameter,
    },
    ContentReply {
        origin: Contact,
        content: Content,
    },
}

impl Message {
    pub fn code(&self) -> MessageCode {
        match self {
            Message::ConnectRequest { .. } => MessageCode::ConnectRequest,
            Message::ConnectReply { .. } => MessageCode::ConnectReply,
            Message::NodeLookupRequest { .. } => MessageCode::NodeLookupRequest,
            Message::NodeReply { .. } => MessageCode::NodeReply,
            Message::StoreRequest { .. } => MessageCode::StoreRequest,
            Message::ContentLookupRequest { .. } => MessageCode::ContentLookupRequest,
            Message::ContentReply { .. } => MessageCode::ContentReply,
        }
    }

    /// Replies are routed by correlation id; requests go to a handler.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.code(),
            MessageCode::ConnectReply | MessageCode::NodeReply | MessageCode::ContentReply
        )
    }

    pub fn origin(&self) -> &Contact {
        match self {
            Message::ConnectRequest { origin }
            | Message::ConnectReply { origin }
            | Message::NodeLookupRequest { origin, .. }
            | Message::NodeReply { origin, .. }
            | Message::StoreRequest { origin, .. }
            | Message::ContentLookupRequest { origin, .. }
            | Message::ContentReply { origin, .. } => origin,
        }
    }

    /// Serialize with the given correlation id:
    /// `code (u8) | correlation (u32 BE) | body`.
    pub fn encode(&self, correlation: u32) -> Result<Vec<u8>, WireError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.code() as u8);
        buf.put_u32(correlation);

        match self {
            Message::ConnectRequest { origin } | Message::ConnectReply { origin } => {
                put_contact(&mut buf, origin);
            }
            Message::NodeLookupRequest { origin, target } => {
                put_contact(&mut buf, origin);
                buf.put_slice(target.as_bytes());
            }
            Message::NodeReply { origin, nodes } => {
                put_contact(&mut buf, origin);
                buf.put_u32(nodes.len() as u32);
                for node in nodes {
                    put_contact(&mut buf, node);
                }
            }
            Message::StoreRequest { origin, content }
            | Message::ContentReply { origin, content } => {
                put_contact(&mut buf, origin);
                put_content(&mut buf, content);
            }
            Message::ContentLookupRequest { origin, params } => {
                put_contact(&mut buf, origin);
                buf.put_slice(params.key.as_bytes());
                put_string(&mut buf, params.owner.as_deref());
                put_string(&mut buf, params.content_type.as_deref());
            }
        }

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized(buf.len()));
        }
        Ok(buf.to_vec())
    }

    /// Deserialize one datagram into its correlation id and body.
    pub fn decode(mut buf: &[u8]) -> Result<(u32, Message), WireError> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized(buf.len()));
        }
        need(buf, 5)?;
        let code = MessageCode::try_from(buf.get_u8())?;
        let correlation = buf.get_u32();

        let message = match code {
            MessageCode::ConnectRequest => Message::ConnectRequest {
                origin: get_contact(&mut buf)?,
            },
            MessageCode::ConnectReply => Message::ConnectReply {
                origin: get_contact(&mut buf)?,
            },
            MessageCode::NodeLookupRequest => Message::NodeLookupRequest {
                origin: get_contact(&mut buf)?,
                target: get_id(&mut buf)?,
            },
            MessageCode::NodeReply => {
                let origin = get_contact(&mut buf)?;
                need(buf, 4)?;
                let count = buf.get_u32() as usize;
                // Each contact is a fixed 28 bytes; a count the body cannot
                // hold is a truncation, not an allocation request.
                if count
                    .checked_mul(ID_BYTES + 8)
                    .map_or(true, |needed| needed > buf.remaining())
                {
                    return Err(WireError::Truncated);
                }
                let mut nodes = Vec::with_capacity(count);
                for _ in 0..count {
                    nodes.push(get_contact(&mut buf)?);
                }
                Message::NodeReply { origin, nodes }
            }
            MessageCode::StoreRequest => Message::StoreRequest {
                origin: get_contact(&mut buf)?,
                content: get_content(&mut buf)?,
            },
            MessageCode::ContentLookupRequest => {
                let origin = get_contact(&mut buf)?;
                let key = get_id(&mut buf)?;
                let owner = get_string(&mut buf, "owner")?;
                let content_type = get_string(&mut buf, "type")?;
                Message::ContentLookupRequest {
                    origin,
                    params: GetParameter {
                        key,
                        owner,
                        content_type,
                    },
                }
            }
            MessageCode::ContentReply => Message::ContentReply {
                origin: get_contact(&mut buf)?,
                content: get_content(&mut buf)?,
            },
        };

        Ok((correlation, message))
    }
}

fn need(buf: &[u8], len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated)
    } else {
        Ok(())
    }
}

fn get_id(buf: &mut &[u8]) -> Result<KadId, WireError> {
    need(buf, ID_BYTES)?;
    let id = KadId::from_bytes(&buf[..ID_BYTES]);
    buf.advance(ID_BYTES);
    Ok(id)
}

/// Contact: 20-byte id, 4-byte IPv4, 4-byte big-endian port.
fn put_contact(buf: &mut BytesMut, contact: &Contact) {
    buf.put_slice(contact.id.as_bytes());
    buf.put_slice(&contact.address.octets());
    buf.put_u32(contact.port as u32);
}

fn get_contact(buf: &mut &[u8]) -> Result<Contact, WireError> {
    let id = get_id(buf)?;
    need(buf, 8)?;
    let address = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    buf.advance(4);
    let port = buf.get_u32() as u16;
    Ok(Contact { id, address, port })
}

/// Length-prefixed UTF-8 (u16 length); an absent field is the empty string.
fn put_string(buf: &mut BytesMut, s: Option<&str>) {
    let bytes = s.unwrap_or("").as_bytes();
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_string(buf: &mut &[u8], field: &'static str) -> Result<Option<String>, WireError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    if len == 0 {
        return Ok(None);
    }
    need(buf, len)?;
    let text = std::str::from_utf8(&buf[..len]).map_err(|_| WireError::InvalidText(field))?;
    let owned = text.to_owned();
    buf.advance(len);
    Ok(Some(owned))
}

/// Content: key, owner, type, then a u32-length value.
fn put_content(buf: &mut BytesMut, content: &Content) {
    buf.put_slice(content.key.as_bytes());
    put_string(buf, content.owner.as_deref());
    put_string(buf, content.content_type.as_deref());
    buf.put_u32(content.value.len() as u32);
    buf.put_slice(&content.value);
}

fn get_content(buf: &mut &[u8]) -> Result<Content, WireError> {
    let key = get_id(buf)?;
    let owner = get_string(buf, "owner")?;
    let content_type = get_string(buf, "type")?;
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    let value = buf[..len].to_vec();
    buf.advance(len);
    Ok(Content {
        key,
        owner,
        content_type,
        value,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::make_contact;

    #[test]
    fn representative_messages_round_trip() {
        let origin = make_contact(1, 7001, 0xAB);
        let peer = make_contact(2, 7002, 0xCD);
        let content = Content::new(KadId::from_hashed(&"doc"), b"payload".to_vec())
            .with_owner("alice")
            .with_type("text");

        let messages = vec![
            Message::ConnectRequest { origin },
            Message::ConnectReply { origin },
            Message::NodeLookupRequest {
                origin,
                target: KadId::from_hashed(&"target"),
            },
            Message::NodeReply {
                origin,
                nodes: vec![origin, peer],
            },
            Message::StoreRequest {
                origin,
                content: content.clone(),
            },
            Message::ContentLookupRequest {
                origin,
                params: GetParameter::new(content.key).with_owner("alice"),
            },
            Message::ContentReply { origin, content },
        ];

        for (i, message) in messages.into_iter().enumerate() {
            let correlation = 0x1000 + i as u32;
            let bytes = message.encode(correlation).unwrap();
            let (got_correlation, got) = Message::decode(&bytes).unwrap();
            assert_eq!(got_correlation, correlation);
            assert_eq!(got, message);
        }
    }

    #[test]
    fn empty_filter_strings_decode_as_absent() {
        let origin = make_contact(1, 7001, 0x01);
        let message = Message::ContentLookupRequest {
            origin,
            params: GetParameter::new(KadId::from_hashed(&"k")),
        };
        let bytes = message.encode(9).unwrap();
        let (_, got) = Message::decode(&bytes).unwrap();
        match got {
            Message::ContentLookupRequest { params, .. } => {
                assert_eq!(params.owner, None);
                assert_eq!(params.content_type, None);
            }
            other => panic!("expected ContentLookupRequest, got {other:?}"),
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        let origin = make_contact(1, 7001, 0x01);
        let mut bytes = Message::ConnectRequest { origin }.encode(1).unwrap();
        bytes[0] = 0x2A;
        assert_eq!(Message::decode(&bytes), Err(WireError::UnknownCode(0x2A)));
    }

    #[test]
    fn truncated_bodies_are_rejected() {
        let origin = make_contact(1, 7001, 0x01);
        let bytes = Message::NodeLookupRequest {
            origin,
            target: KadId::random(),
        }
        .encode(1)
        .unwrap();

        for len in [0, 4, 6, bytes.len() - 1] {
            assert_eq!(Message::decode(&bytes[..len]), Err(WireError::Truncated));
        }
    }

    #[test]
    fn node_reply_count_cannot_exceed_body() {
        let origin = make_contact(1, 7001, 0x01);
        let mut bytes = Message::NodeReply {
            origin,
            nodes: vec![origin],
        }
        .encode(1)
        .unwrap();
        // Inflate the count field without providing the contacts.
        let count_at = 5 + ID_BYTES + 8;
        bytes[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(Message::decode(&bytes), Err(WireError::Truncated));
    }

    #[test]
    fn oversized_datagrams_are_refused_both_ways() {
        let origin = make_contact(1, 7001, 0x01);
        let content = Content::new(KadId::random(), vec![0u8; MAX_MESSAGE_SIZE]);
        let err = Message::StoreRequest { origin, content }.encode(1).unwrap_err();
        assert!(matches!(err, WireError::Oversized(_)));

        let huge = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            Message::decode(&huge),
            Err(WireError::Oversized(_))
        ));
    }
}
