//! Message header and its wire layout.
//!
//! ```text
//! version(1) ratchet_key(32) previous_counter(4 LE) counter(4 LE) flags(1)
//!   [identity_key(32) ephemeral_key(32) signed_prekey_id(4 LE) [one_time_prekey_id(4 LE)]]
//!   mac(16)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

pub const HEADER_MAC_LEN: usize = 16;

const WIRE_VERSION: u8 = 1;
const FLAG_PREKEY: u8 = 0x01;
const FLAG_ONE_TIME_PREKEY: u8 = 0x02;
const FIXED_LEN: usize = 1 + 32 + 4 + 4 + 1;

/// Key agreement parameters carried by an initiator until the responder replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyHeader {
    /// Initiator's Ed25519 identity key.
    pub identity_key: [u8; 32],
    /// Initiator's ephemeral X25519 public key.
    pub ephemeral_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_counter: u32,
    /// Index of this message in the sending chain.
    pub counter: u32,
    pub prekey: Option<PrekeyHeader>,
    /// Truncated HMAC over every other field, keyed by the chain's header key.
    pub mac: [u8; HEADER_MAC_LEN],
}

impl MessageHeader {
    /// Bytes covered by `mac`.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_LEN + 72);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&self.ratchet_key);
        out.extend_from_slice(&self.previous_counter.to_le_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes());

        let mut flags = 0u8;
        if let Some(prekey) = &self.prekey {
            flags |= FLAG_PREKEY;
            if prekey.one_time_prekey_id.is_some() {
                flags |= FLAG_ONE_TIME_PREKEY;
            }
        }
        out.push(flags);

        if let Some(prekey) = &self.prekey {
            out.extend_from_slice(&prekey.identity_key);
            out.extend_from_slice(&prekey.ephemeral_key);
            out.extend_from_slice(&prekey.signed_prekey_id.to_le_bytes());
            if let Some(id) = prekey.one_time_prekey_id {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.authenticated_bytes();
        out.extend_from_slice(&self.mac);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (header, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(CryptoError::MalformedMessage(format!(
                "{} trailing bytes after header",
                bytes.len() - used
            )));
        }
        Ok(header)
    }

    /// Decode a header from the front of `bytes`, returning it and the number
    /// of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), CryptoError> {
        let mut reader = Reader { bytes, pos: 0 };

        let version = reader.u8()?;
        if version != WIRE_VERSION {
            return Err(CryptoError::MalformedMessage(format!(
                "unsupported header version {version}"
            )));
        }
        let ratchet_key = reader.array32()?;
        let previous_counter = reader.u32()?;
        let counter = reader.u32()?;
        let flags = reader.u8()?;
        if flags & !(FLAG_PREKEY | FLAG_ONE_TIME_PREKEY) != 0
            || (flags & FLAG_ONE_TIME_PREKEY != 0 && flags & FLAG_PREKEY == 0)
        {
            return Err(CryptoError::MalformedMessage(format!(
                "invalid header flags {flags:#04x}"
            )));
        }

        let prekey = if flags & FLAG_PREKEY != 0 {
            let identity_key = reader.array32()?;
            let ephemeral_key = reader.array32()?;
            let signed_prekey_id = reader.u32()?;
            let one_time_prekey_id = if flags & FLAG_ONE_TIME_PREKEY != 0 {
                Some(reader.u32()?)
            } else {
                None
            };
            Some(PrekeyHeader {
                identity_key,
                ephemeral_key,
                signed_prekey_id,
                one_time_prekey_id,
            })
        } else {
            None
        };

        let mac = <[u8; HEADER_MAC_LEN]>::try_from(reader.take(HEADER_MAC_LEN)?)
            .map_err(|_| CryptoError::MalformedMessage("header mac".into()))?;

        Ok((
            Self {
                ratchet_key,
                previous_counter,
                counter,
                prekey,
                mac,
            },
            reader.pos,
        ))
    }
}

/// One encrypted message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub header: MessageHeader,
    /// AES-256-GCM ciphertext with appended tag.
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    /// True while the sender still awaits the first reply (the message can
    /// create a session on the receiving side).
    pub fn is_prekey_message(&self) -> bool {
        self.header.prekey.is_some()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.encode();
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (header, used) = MessageHeader::decode_prefix(bytes)?;
        Ok(Self {
            header,
            ciphertext: bytes[used..].to_vec(),
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        let end = self.pos + len;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            CryptoError::MalformedMessage(format!(
                "header truncated: need {end} bytes, have {}",
                self.bytes.len()
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CryptoError> {
        let raw = <[u8; 4]>::try_from(self.take(4)?)
            .map_err(|_| CryptoError::MalformedMessage("u32 field".into()))?;
        Ok(u32::from_le_bytes(raw))
    }

    fn array32(&mut self) -> Result<[u8; 32], CryptoError> {
        <[u8; 32]>::try_from(self.take(32)?)
            .map_err(|_| CryptoError::MalformedMessage("key field".into()))
    }
}
