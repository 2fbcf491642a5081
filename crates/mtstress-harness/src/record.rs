//! Wire framing for the simulated session protocol.
//!
//! Every record is a 3-byte header followed by its body:
//!
//! ```text
//! ┌──────┬────────────┬─────────────────┐
//! │ kind │ len (u16BE)│ body (len bytes)│
//! └──────┴────────────┴─────────────────┘
//! ```

use thiserror::Error;

/// Record types of the simulated protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Client opens the handshake, offering a session id (0 = none)
    ClientHello = 1,
    /// Server answers with the session id and whether it was resumed
    ServerHello = 2,
    /// Client confirms the handshake
    Finished = 3,
    /// Application data
    AppData = 4,
    /// Handshake rejected
    Alert = 5,
    /// Orderly close
    Close = 6,
}

impl RecordKind {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::ClientHello,
            2 => Self::ServerHello,
            3 => Self::Finished,
            4 => Self::AppData,
            5 => Self::Alert,
            6 => Self::Close,
            _ => return None,
        })
    }
}

/// Malformed record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Header carries an unknown record type.
    #[error("unknown record kind {0:#04x}")]
    UnknownKind(u8),

    /// Body does not match what the record type requires.
    #[error("malformed {kind:?} body ({len} bytes)")]
    Malformed {
        /// Record type
        kind: RecordKind,
        /// Body length
        len: usize,
    },
}

/// One framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record type
    pub kind: RecordKind,
    /// Record body
    pub body: Vec<u8>,
}

impl Record {
    /// Size of the record header.
    pub const HEADER_LEN: usize = 3;

    /// Largest body a single record carries.
    pub const MAX_BODY: usize = u16::MAX as usize;

    /// Build a record; bodies longer than [`Record::MAX_BODY`] are truncated.
    pub fn new(kind: RecordKind, body: &[u8]) -> Self {
        Self { kind, body: body[..body.len().min(Self::MAX_BODY)].to_vec() }
    }

    /// `ClientHello` offering `session_id` (0 offers nothing).
    pub fn client_hello(session_id: u64) -> Self {
        Self::new(RecordKind::ClientHello, &session_id.to_be_bytes())
    }

    /// `ServerHello` granting `session_id`.
    pub fn server_hello(session_id: u64, resumed: bool) -> Self {
        let mut body = vec![u8::from(resumed)];
        body.extend_from_slice(&session_id.to_be_bytes());
        Self { kind: RecordKind::ServerHello, body }
    }

    /// Size of the encoded record.
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.body.len()
    }

    /// Append the encoded record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
    }

    /// Decode the first record of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupied, or `None`
    /// while the record is still incomplete.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Self, usize)>, RecordError> {
        let Some(&[kind, hi, lo]) = bytes.get(..Self::HEADER_LEN) else {
            return Ok(None);
        };
        let kind = RecordKind::from_u8(kind).ok_or(RecordError::UnknownKind(kind))?;
        let len = usize::from(u16::from_be_bytes([hi, lo]));

        let end = Self::HEADER_LEN + len;
        let Some(body) = bytes.get(Self::HEADER_LEN..end) else {
            return Ok(None);
        };
        Ok(Some((Self { kind, body: body.to_vec() }, end)))
    }

    /// Session id carried by a `ClientHello` (0 = none).
    pub fn offered_session(&self) -> Result<u64, RecordError> {
        self.body_u64(0)
    }

    /// Session id and resumption flag carried by a `ServerHello`.
    pub fn granted_session(&self) -> Result<(u64, bool), RecordError> {
        let resumed = self.body.first().copied().unwrap_or(0) != 0;
        Ok((self.body_u64(1)?, resumed))
    }

    fn body_u64(&self, at: usize) -> Result<u64, RecordError> {
        let malformed = || RecordError::Malformed { kind: self.kind, len: self.body.len() };
        if self.body.len() != at + 8 {
            return Err(malformed());
        }
        let bytes: [u8; 8] = self.body[at..].try_into().map_err(|_| malformed())?;
        Ok(u64::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn partial_record_is_incomplete() {
        let mut wire = Vec::new();
        Record::new(RecordKind::AppData, b"hello").encode_into(&mut wire);

        assert_eq!(Record::decode(&wire[..2]), Ok(None));
        assert_eq!(Record::decode(&wire[..6]), Ok(None));

        let (record, used) = Record::decode(&wire).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(record.body, b"hello");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(Record::decode(&[0x7f, 0, 0]), Err(RecordError::UnknownKind(0x7f)));
    }

    #[test]
    fn hello_bodies() {
        assert_eq!(Record::client_hello(42).offered_session(), Ok(42));
        assert_eq!(Record::server_hello(7, true).granted_session(), Ok((7, true)));

        let short = Record::new(RecordKind::ClientHello, &[1, 2]);
        assert!(matches!(short.offered_session(), Err(RecordError::Malformed { len: 2, .. })));
    }

    proptest! {
        #[test]
        fn consecutive_records_split_cleanly(bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..8)) {
            let mut wire = Vec::new();
            for body in &bodies {
                Record::new(RecordKind::AppData, body).encode_into(&mut wire);
            }

            let mut offset = 0;
            for body in &bodies {
                let (record, used) = Record::decode(&wire[offset..]).unwrap().unwrap();
                prop_assert_eq!(&record.body, body);
                offset += used;
            }
            prop_assert_eq!(offset, wire.len());
        }
    }
}
