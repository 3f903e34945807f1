//! Framed request messages exchanged between a transport and the daemon.
//!
//! Every frame starts with a fixed header (`msg_size`, `msg_type`,
//! `msg_from`, `pub_guid`) followed by a type specific body. Values inside
//! bodies reuse the codec in [`crate::datatype`].

use crate::construct::{PublicationBatch, Snapshot};
use crate::datatype::{self, Reader, ValueType};
use crate::error::{Result, VantageError};

/// `msg_size: u32` + `msg_type: u8` + `msg_from: u64` + `pub_guid: u64`
pub const HEADER_SIZE: usize = 4 + 1 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Register,
    Announce,
    Publish,
    Query,
    Echo,
    Unregister,
    Shutdown,
}

impl MessageType {
    fn tag(&self) -> u8 {
        match self {
            MessageType::Register => 1,
            MessageType::Announce => 2,
            MessageType::Publish => 3,
            MessageType::Query => 4,
            MessageType::Echo => 5,
            MessageType::Unregister => 6,
            MessageType::Shutdown => 7,
        }
    }
    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => MessageType::Register,
            2 => MessageType::Announce,
            3 => MessageType::Publish,
            4 => MessageType::Query,
            5 => MessageType::Echo,
            6 => MessageType::Unregister,
            7 => MessageType::Shutdown,
            other => return Err(VantageError::Decode(format!("unknown message type {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_size: u32,
    pub msg_type: MessageType,
    pub msg_from: u64,
    pub pub_guid: u64,
}

/// Who is connecting, sent with `Register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub program_name: String,
    pub program_version: String,
    pub title: String,
    pub node_id: String,
    pub process_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Register(Identity),
    Announce(Vec<(String, ValueType)>),
    Publish(PublicationBatch),
    Query(String),
    Echo(Vec<u8>),
    Unregister,
    Shutdown,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register(_) => MessageType::Register,
            Message::Announce(_) => MessageType::Announce,
            Message::Publish(_) => MessageType::Publish,
            Message::Query(_) => MessageType::Query,
            Message::Echo(_) => MessageType::Echo,
            Message::Unregister => MessageType::Unregister,
            Message::Shutdown => MessageType::Shutdown,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub message: Message,
}

pub fn encode(msg_from: u64, pub_guid: u64, message: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    // msg_size is patched in once the body is known
    out.extend_from_slice(&0u32.to_le_bytes());
    out.push(message.message_type().tag());
    out.extend_from_slice(&msg_from.to_le_bytes());
    out.extend_from_slice(&pub_guid.to_le_bytes());
    match message {
        Message::Register(identity) => {
            datatype::encode_str(&identity.program_name, &mut out)?;
            datatype::encode_str(&identity.program_version, &mut out)?;
            datatype::encode_str(&identity.title, &mut out)?;
            datatype::encode_str(&identity.node_id, &mut out)?;
            out.extend_from_slice(&identity.process_id.to_le_bytes());
        }
        Message::Announce(schema) => {
            out.extend_from_slice(&count(schema.len())?.to_le_bytes());
            for (name, value_type) in schema {
                datatype::encode_str(name, &mut out)?;
                out.push(value_type.tag());
            }
        }
        Message::Publish(batch) => {
            out.extend_from_slice(&batch.frame.to_le_bytes());
            out.extend_from_slice(&batch.time_send.to_bits().to_le_bytes());
            out.extend_from_slice(&count(batch.len())?.to_le_bytes());
            for snapshot in batch.entries() {
                datatype::encode_str(&snapshot.name, &mut out)?;
                out.push(snapshot.value_type().tag());
                out.extend_from_slice(&snapshot.seq.to_le_bytes());
                out.extend_from_slice(&snapshot.time_pack.to_bits().to_le_bytes());
                datatype::encode_into(snapshot.value_type(), &snapshot.value, &mut out)?;
            }
        }
        Message::Query(sql) => datatype::encode_str(sql, &mut out)?,
        Message::Echo(payload) => {
            out.extend_from_slice(&count(payload.len())?.to_le_bytes());
            out.extend_from_slice(payload);
        }
        Message::Unregister | Message::Shutdown => (),
    }
    let size = count(out.len())?;
    out[..4].copy_from_slice(&size.to_le_bytes());
    Ok(out)
}

pub fn decode(frame: &[u8]) -> Result<Envelope> {
    let mut reader = Reader::new(frame);
    let msg_size = reader.u32()?;
    if msg_size as usize != frame.len() {
        return Err(VantageError::Decode(format!(
            "frame announces {} bytes but carries {}",
            msg_size,
            frame.len()
        )));
    }
    let header = Header {
        msg_size,
        msg_type: MessageType::from_tag(reader.u8()?)?,
        msg_from: reader.u64()?,
        pub_guid: reader.u64()?,
    };
    let message = match header.msg_type {
        MessageType::Register => Message::Register(Identity {
            program_name: reader.string()?,
            program_version: reader.string()?,
            title: reader.string()?,
            node_id: reader.string()?,
            process_id: reader.u32()?,
        }),
        MessageType::Announce => {
            let n = reader.u32()?;
            let mut schema = Vec::new();
            for _ in 0..n {
                let name = reader.string()?;
                let value_type = ValueType::from_tag(reader.u8()?)?;
                schema.push((name, value_type));
            }
            Message::Announce(schema)
        }
        MessageType::Publish => {
            let frame = reader.u64()?;
            let time_send = reader.f64()?;
            let n = reader.u32()?;
            let mut entries = Vec::new();
            for _ in 0..n {
                let name = reader.string()?;
                let value_type = ValueType::from_tag(reader.u8()?)?;
                let seq = reader.u64()?;
                let time_pack = reader.f64()?;
                let value = reader.value(value_type)?;
                entries.push(Snapshot { name, value, seq, time_pack });
            }
            Message::Publish(PublicationBatch::from_entries(frame, time_send, entries))
        }
        MessageType::Query => Message::Query(reader.string()?),
        MessageType::Echo => Message::Echo(reader.bytes()?.to_vec()),
        MessageType::Unregister => Message::Unregister,
        MessageType::Shutdown => Message::Shutdown,
    };
    reader.finish()?;
    Ok(Envelope { header, message })
}

fn count(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| VantageError::Decode(format!("length {n} does not fit a frame")))
}
