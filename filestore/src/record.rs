use std::convert::{TryFrom, TryInto};

use crate::error::{Result, StoreError};

/// Fixed-width part of a serialized record, ahead of name and content.
pub const RECORD_PREAMBLE_SIZE: usize = 33;

/// A client-visible file. Each `FileStore::load` hands out a fresh copy;
/// the store keeps nothing of it in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: i32,
    /// Id of the owning user.
    pub owner_id: i32,
    pub name: String,
    pub content: Vec<u8>,
    /// Seconds since epoch.
    pub create_time: i64,
    /// Seconds since epoch after which the file is moved to the bin.
    pub expire_time: i64,
    /// Set once the file expired and sits in the recycle bin.
    pub in_bin: bool,
}

impl FileRecord {
    pub fn new(file_id: i32, owner_id: i32, name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            file_id,
            owner_id,
            name: name.into(),
            content,
            create_time: 0,
            expire_time: i64::MAX,
            in_bin: false,
        }
    }

    pub fn with_times(mut self, create_time: i64, expire_time: i64) -> Self {
        self.create_time = create_time;
        self.expire_time = expire_time;
        self
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_time < now
    }

    /// Serializes the record into a single blob: the little endian preamble
    /// `file_id i32, owner_id i32, create_time i64, expire_time i64, in_bin u8,
    /// name_len u32, content_len u32` followed by the name and the content.
    /// Names or contents of 4 GiB and more do not fit the preamble.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let name = self.name.as_bytes();
        let name_len = encode_len(name.len(), "name longer than 4 GiB")?;
        let content_len = encode_len(self.content.len(), "content longer than 4 GiB")?;
        let mut encoded =
            Vec::with_capacity(RECORD_PREAMBLE_SIZE + name.len() + self.content.len());
        encoded.extend_from_slice(&self.file_id.to_le_bytes());
        encoded.extend_from_slice(&self.owner_id.to_le_bytes());
        encoded.extend_from_slice(&self.create_time.to_le_bytes());
        encoded.extend_from_slice(&self.expire_time.to_le_bytes());
        encoded.push(self.in_bin as u8);
        encoded.extend_from_slice(&name_len.to_le_bytes());
        encoded.extend_from_slice(&content_len.to_le_bytes());
        encoded.extend_from_slice(name);
        encoded.extend_from_slice(&self.content);
        Ok(encoded)
    }

    /// Reads a record from a blob produced by `serialize`. Trailing bytes past
    /// the declared lengths are rejected.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_PREAMBLE_SIZE {
            return Err(StoreError::InvalidRecord("record shorter than its preamble"));
        }
        let file_id = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let owner_id = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let create_time = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let expire_time = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        let in_bin = match buf[24] {
            0 => false,
            1 => true,
            _ => return Err(StoreError::InvalidRecord("bin flag is not a boolean")),
        };
        let name_len = u32::from_le_bytes(buf[25..29].try_into().unwrap()) as usize;
        let content_len = u32::from_le_bytes(buf[29..33].try_into().unwrap()) as usize;

        let name_end = RECORD_PREAMBLE_SIZE + name_len;
        if name_end.checked_add(content_len) != Some(buf.len()) {
            return Err(StoreError::InvalidRecord(
                "record length disagrees with its preamble",
            ));
        }
        let name = String::from_utf8(buf[RECORD_PREAMBLE_SIZE..name_end].to_vec())
            .map_err(|_| StoreError::InvalidRecord("name is not valid UTF-8"))?;

        Ok(Self {
            file_id,
            owner_id,
            name,
            content: buf[name_end..].to_vec(),
            create_time,
            expire_time,
            in_bin,
        })
    }
}

fn encode_len(len: usize, too_long: &'static str) -> Result<u32> {
    u32::try_from(len).map_err(|_| StoreError::InvalidRecord(too_long))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_encode_and_decode_records() {
        let mut record = FileRecord::new(42, 7, "notes.txt", b"some content".to_vec())
            .with_times(1_600_000_000, 1_700_000_000);
        record.in_bin = true;

        let encoded = record.serialize().unwrap();
        assert_eq!(encoded.len(), RECORD_PREAMBLE_SIZE + 9 + 12);
        assert_eq!(FileRecord::parse(&encoded).unwrap(), record);
    }

    #[test]
    fn empty_name_and_content_are_valid() {
        let record = FileRecord::new(1, 1, "", Vec::new());
        let encoded = record.serialize().unwrap();
        assert_eq!(encoded.len(), RECORD_PREAMBLE_SIZE);
        assert_eq!(FileRecord::parse(&encoded).unwrap(), record);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let encoded = FileRecord::new(1, 1, "a", vec![1, 2, 3]).serialize().unwrap();
        assert!(FileRecord::parse(&encoded[..encoded.len() - 1]).is_err());
        assert!(FileRecord::parse(&encoded[..10]).is_err());
    }

    #[test]
    fn lengths_past_u32_are_rejected() {
        assert_eq!(encode_len(u32::MAX as usize, "too long").unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            encode_len(u32::MAX as usize + 1, "too long"),
            Err(StoreError::InvalidRecord("too long"))
        ));
    }

    #[test]
    fn expiry_is_strictly_after_expire_time() {
        let record = FileRecord::new(1, 1, "a", Vec::new()).with_times(0, 100);
        assert!(!record.is_expired(100));
        assert!(record.is_expired(101));
    }
}
