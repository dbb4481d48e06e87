// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Binary batch format exchanged over the backplane channel.
//!
//! ```text
//! u8 version | [u8; 16] origin | { u8 action | u8 flags | [u32 len | key] | [u32 len | region] }*
//! ```
//!
//! Integers are little-endian. Flag bit 0 marks a key, bit 1 a region.

use tierlink_handle::{BackplaneAction, BackplaneMessage, ChangeAction, Error, ErrorKind, OriginId, Result};

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 16;
const FLAG_KEY: u8 = 0b01;
const FLAG_REGION: u8 = 0b10;

/// Upper bound for a single published payload.
pub(crate) const MAX_CHUNK_BYTES: usize = 1024 * 1024;

fn action_code(action: BackplaneAction) -> u8 {
    match action {
        BackplaneAction::Changed(ChangeAction::Add) => 0,
        BackplaneAction::Changed(ChangeAction::Put) => 1,
        BackplaneAction::Changed(ChangeAction::Update) => 2,
        BackplaneAction::Removed => 3,
        BackplaneAction::Clear => 4,
        BackplaneAction::ClearRegion => 5,
    }
}

fn action_from_code(code: u8) -> Option<BackplaneAction> {
    Some(match code {
        0 => BackplaneAction::Changed(ChangeAction::Add),
        1 => BackplaneAction::Changed(ChangeAction::Put),
        2 => BackplaneAction::Changed(ChangeAction::Update),
        3 => BackplaneAction::Removed,
        4 => BackplaneAction::Clear,
        5 => BackplaneAction::ClearRegion,
        _ => return None,
    })
}

fn encoded_len(message: &BackplaneMessage) -> usize {
    2 + message.key().map_or(0, |key| 4 + key.len()) + message.region().map_or(0, |region| 4 + region.len())
}

fn write_message(buffer: &mut Vec<u8>, message: &BackplaneMessage) {
    let mut flags = 0;
    if message.key().is_some() {
        flags |= FLAG_KEY;
    }
    if message.region().is_some() {
        flags |= FLAG_REGION;
    }

    buffer.push(action_code(message.action()));
    buffer.push(flags);
    for text in [message.key(), message.region()].into_iter().flatten() {
        let len = u32::try_from(text.len()).unwrap_or(u32::MAX);
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(text.as_bytes());
    }
}

fn new_chunk(origin: OriginId) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(HEADER_LEN);
    chunk.push(FORMAT_VERSION);
    chunk.extend_from_slice(origin.as_bytes());
    chunk
}

/// Encodes `messages` into one or more payloads of at most `max_chunk_bytes` each.
///
/// A single message larger than the limit gets a payload of its own.
pub(crate) fn encode(origin: OriginId, messages: &[BackplaneMessage], max_chunk_bytes: usize) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut current = new_chunk(origin);

    for message in messages {
        if current.len() > HEADER_LEN && current.len() + encoded_len(message) > max_chunk_bytes {
            chunks.push(std::mem::replace(&mut current, new_chunk(origin)));
        }
        write_message(&mut current, message);
    }

    if current.len() > HEADER_LEN {
        chunks.push(current);
    }
    chunks
}

/// Cursor over a received payload.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(Error::with_cause(ErrorKind::Serialization, "truncated backplane payload"));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn text(&mut self) -> Result<&'a str> {
        let mut len = [0; 4];
        len.copy_from_slice(self.take(4)?);
        let len = usize::try_from(u32::from_le_bytes(len))
            .map_err(|e| Error::with_cause(ErrorKind::Serialization, e))?;
        std::str::from_utf8(self.take(len)?).map_err(|e| Error::with_cause(ErrorKind::Serialization, e))
    }
}

/// Decodes a payload into its origin and messages.
pub(crate) fn decode(payload: &[u8]) -> Result<(OriginId, Vec<BackplaneMessage>)> {
    let mut reader = Reader { bytes: payload };

    let version = reader.byte()?;
    if version != FORMAT_VERSION {
        return Err(Error::with_cause(
            ErrorKind::Serialization,
            format!("unsupported backplane format version {version}"),
        ));
    }

    let mut origin = [0; 16];
    origin.copy_from_slice(reader.take(16)?);
    let origin = OriginId::from_bytes(origin);

    let mut messages = Vec::new();
    while !reader.bytes.is_empty() {
        let code = reader.byte()?;
        let action = action_from_code(code)
            .ok_or_else(|| Error::with_cause(ErrorKind::Serialization, format!("unknown backplane action {code}")))?;
        let flags = reader.byte()?;
        let key = if flags & FLAG_KEY == 0 { None } else { Some(reader.text()?) };
        let region = if flags & FLAG_REGION == 0 { None } else { Some(reader.text()?) };
        messages.push(BackplaneMessage::new(origin, action, key, region));
    }

    Ok((origin, messages))
}
