//! Binary framing for write-ahead log records.
//!
//! Every record starts with a fixed 40-byte header (host-native byte order,
//! not portable across architectures — consistent with how the segment
//! files themselves are documented). A `Put` record additionally carries the
//! tube name and job body immediately after the header. Unwritten,
//! zero-padded space in a preallocated segment decodes as a header with
//! `tag == 0`, which callers read as "end of log".

pub const HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Ready = 0,
    Delayed = 1,
    Buried = 2,
}

impl RecordState {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordState::Ready),
            1 => Some(RecordState::Delayed),
            2 => Some(RecordState::Buried),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Put {
        id: u64,
        tube: Vec<u8>,
        priority: u32,
        delay_secs: u32,
        ttr_secs: u32,
        body: Vec<u8>,
    },
    Update {
        id: u64,
        priority: u32,
        delay_secs: u32,
        ttr_secs: u32,
        state: RecordState,
    },
    Delete {
        id: u64,
    },
}

impl Record {
    pub fn id(&self) -> u64 {
        match self {
            Record::Put { id, .. } | Record::Update { id, .. } | Record::Delete { id } => *id,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Record::Put { tube, body, .. } => HEADER_LEN + tube.len() + body.len(),
            Record::Update { .. } | Record::Delete { .. } => HEADER_LEN,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        match self {
            Record::Put { id, tube, priority, delay_secs, ttr_secs, body } => {
                buf[0] = 1;
                buf[4..12].copy_from_slice(&id.to_ne_bytes());
                buf[12..16].copy_from_slice(&priority.to_ne_bytes());
                buf[16..20].copy_from_slice(&delay_secs.to_ne_bytes());
                buf[20..24].copy_from_slice(&ttr_secs.to_ne_bytes());
                buf[28..30].copy_from_slice(&(tube.len() as u16).to_ne_bytes());
                buf[32..36].copy_from_slice(&(body.len() as u32).to_ne_bytes());
                buf[HEADER_LEN..HEADER_LEN + tube.len()].copy_from_slice(tube);
                buf[HEADER_LEN + tube.len()..].copy_from_slice(body);
            },
            Record::Update { id, priority, delay_secs, ttr_secs, state } => {
                buf[0] = 2;
                buf[4..12].copy_from_slice(&id.to_ne_bytes());
                buf[12..16].copy_from_slice(&priority.to_ne_bytes());
                buf[16..20].copy_from_slice(&delay_secs.to_ne_bytes());
                buf[20..24].copy_from_slice(&ttr_secs.to_ne_bytes());
                buf[25] = *state as u8;
            },
            Record::Delete { id } => {
                buf[0] = 3;
                buf[4..12].copy_from_slice(&id.to_ne_bytes());
            },
        }
        buf
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the header tag is `0` (unwritten space — end
    /// of log). Returns `Err(())` for a header that doesn't fit in `buf`, an
    /// unrecognised tag, or a body that would run past the end of `buf`;
    /// callers treat this as a corrupt trailing record and stop replay
    /// there.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ()> {
        if buf.len() < HEADER_LEN {
            return Err(());
        }
        let tag = buf[0];
        if tag == 0 {
            return Ok(None);
        }

        let id = u64::from_ne_bytes(buf[4..12].try_into().unwrap());
        let priority = u32::from_ne_bytes(buf[12..16].try_into().unwrap());
        let delay_secs = u32::from_ne_bytes(buf[16..20].try_into().unwrap());
        let ttr_secs = u32::from_ne_bytes(buf[20..24].try_into().unwrap());

        match tag {
            1 => {
                let tube_len =
                    u16::from_ne_bytes(buf[28..30].try_into().unwrap()) as usize;
                let body_len =
                    u32::from_ne_bytes(buf[32..36].try_into().unwrap()) as usize;
                let total = HEADER_LEN + tube_len + body_len;
                if buf.len() < total {
                    return Err(());
                }
                let tube = buf[HEADER_LEN..HEADER_LEN + tube_len].to_vec();
                let body = buf[HEADER_LEN + tube_len..total].to_vec();
                Ok(Some((
                    Record::Put { id, tube, priority, delay_secs, ttr_secs, body },
                    total,
                )))
            },
            2 => {
                let state = RecordState::from_u8(buf[25]).ok_or(())?;
                Ok(Some((
                    Record::Update { id, priority, delay_secs, ttr_secs, state },
                    HEADER_LEN,
                )))
            },
            3 => Ok(Some((Record::Delete { id }, HEADER_LEN))),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_put() {
        let rec = Record::Put {
            id: 42,
            tube: b"default".to_vec(),
            priority: 10,
            delay_secs: 5,
            ttr_secs: 60,
            body: b"hello world".to_vec(),
        };
        let bytes = rec.encode();
        let (decoded, len) = Record::decode(&bytes).unwrap().unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(decoded, rec);
    }

    #[test]
    fn round_trips_update_and_delete() {
        let upd = Record::Update {
            id: 7,
            priority: 99,
            delay_secs: 0,
            ttr_secs: 120,
            state: RecordState::Buried,
        };
        let bytes = upd.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        let (decoded, _) = Record::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, upd);

        let del = Record::Delete { id: 7 };
        let bytes = del.encode();
        let (decoded, _) = Record::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, del);
    }

    #[test]
    fn zero_tag_is_end_of_log() {
        let padding = vec![0u8; HEADER_LEN * 2];
        assert_eq!(Record::decode(&padding).unwrap(), None);
    }

    #[test]
    fn truncated_put_is_corrupt() {
        let rec = Record::Put {
            id: 1,
            tube: b"default".to_vec(),
            priority: 0,
            delay_secs: 0,
            ttr_secs: 60,
            body: b"0123456789".to_vec(),
        };
        let mut bytes = rec.encode();
        bytes.truncate(bytes.len() - 3);
        assert_eq!(Record::decode(&bytes), Err(()));
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 200;
        assert_eq!(Record::decode(&buf), Err(()));
    }
}
