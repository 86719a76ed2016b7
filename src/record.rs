//! The fixed-size (key, payload) pair that is the unit of user data.

/// Reserved key value meaning "empty slot". User keys must never equal
/// this; the same constant is reused as the "absent" sentinel for
/// index-page pointer and parent fields (see `crate::page`).
pub const SENTINEL: i32 = 0x7FFF_FFFF;

/// Payload is padded with this byte out to [`PAYLOAD_LEN`]. Since it is
/// the padding character, it may not appear in a real payload.
pub const PAYLOAD_PAD: u8 = b'.';

/// Fixed payload width, in bytes.
pub const PAYLOAD_LEN: usize = 30;

/// On-disk size of one record: a 4-byte key plus the padded payload.
pub const RECORD_SIZE: usize = 4 + PAYLOAD_LEN;

/// A (key, payload) pair — the unit of heap storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: i32,
    pub payload: String,
}

impl Record {
    /// Construct a record, validating the key and payload against the
    /// sentinel constraints.
    pub fn new(key: i32, payload: impl Into<String>) -> Result<Record, String> {
        let payload = payload.into();
        if key == SENTINEL {
            return Err(format!("key {} collides with the empty-slot sentinel", SENTINEL));
        }
        if payload.len() > PAYLOAD_LEN {
            return Err(format!(
                "payload of length {} exceeds the {}-byte limit",
                payload.len(),
                PAYLOAD_LEN
            ));
        }
        if !payload.is_ascii() {
            return Err("payload must be ASCII (it is packed into a fixed byte width)".to_string());
        }
        if payload.contains(PAYLOAD_PAD as char) {
            return Err(format!(
                "payload may not contain '{}', the padding sentinel",
                PAYLOAD_PAD as char
            ));
        }
        Ok(Record { key, payload })
    }

    pub(crate) fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [PAYLOAD_PAD; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.key.to_be_bytes());
        let bytes = self.payload.as_bytes();
        buf[4..4 + bytes.len()].copy_from_slice(bytes);
        buf
    }

    /// An empty slot's 34-byte on-disk representation: sentinel key
    /// followed by 30 padding bytes.
    pub(crate) fn empty_bytes() -> [u8; RECORD_SIZE] {
        let mut buf = [PAYLOAD_PAD; RECORD_SIZE];
        buf[0..4].copy_from_slice(&SENTINEL.to_be_bytes());
        buf
    }

    /// Decode a slot; returns `None` for the empty-slot sentinel.
    pub(crate) fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Option<Record> {
        let key = i32::from_be_bytes(buf[0..4].try_into().unwrap());
        if key == SENTINEL {
            return None;
        }
        let payload_bytes = &buf[4..];
        let end = payload_bytes
            .iter()
            .position(|&b| b == PAYLOAD_PAD)
            .unwrap_or(PAYLOAD_LEN);
        let payload = String::from_utf8_lossy(&payload_bytes[..end]).into_owned();
        Some(Record { key, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let record = Record::new(42, "hello").unwrap();
        let bytes = record.to_bytes();
        let back = Record::from_bytes(&bytes).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn empty_slot_decodes_to_none() {
        let bytes = Record::empty_bytes();
        assert!(Record::from_bytes(&bytes).is_none());
    }

    #[test]
    fn rejects_sentinel_key() {
        assert!(Record::new(SENTINEL, "x").is_err());
    }

    #[test]
    fn rejects_payload_containing_pad_byte() {
        assert!(Record::new(1, "a.b").is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let s = "a".repeat(PAYLOAD_LEN + 1);
        assert!(Record::new(1, s).is_err());
    }
}
