use crate::bins::SliceExt;
use crate::id::{PageId, PageIdExt, RecordId};
use anyhow::anyhow;

/// A row as seen by callers of the heap: a sequence of opaque column values.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Row {
    pub columns: Vec<Vec<u8>>,
}

impl Row {
    pub fn new(columns: Vec<Vec<u8>>) -> Self {
        Self { columns }
    }
}

/// One stored field inside a row piece. A long column's bytes live on an
/// overflow-page chain; only the head pointer is stored inline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Field {
    Inline(Vec<u8>),
    Long(PageId),
}

impl Field {
    pub(crate) fn encoded_size(&self) -> usize {
        match self {
            Field::Inline(bytes) => FIELD_INLINE_HEADER + bytes.len(),
            Field::Long(_) => FIELD_LONG_SIZE,
        }
    }
}

/// The wire form of a record payload on a data page: the fields of this row
/// piece plus, for an overflowed row, a continuation pointer to the next
/// piece.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct RecordPayload {
    pub(crate) fields: Vec<Field>,
    pub(crate) continuation: Option<(PageId, RecordId)>,
}

pub(crate) const RECORD_PREFIX_SIZE: usize = 3;
const FIELD_INLINE_HEADER: usize = 1 + 4;
const FIELD_LONG_SIZE: usize = 1 + 8;
const CONTINUATION_SIZE: usize = 8 + 4;

const FIELD_MARKER_INLINE: u8 = 0;
const FIELD_MARKER_LONG: u8 = 1;

const RECORD_FLAG_CONTINUATION: u8 = 0x1;

impl RecordPayload {
    pub(crate) fn inline(columns: &[Vec<u8>]) -> Self {
        Self {
            fields: columns.iter().map(|c| Field::Inline(c.clone())).collect(),
            continuation: None,
        }
    }

    pub(crate) fn encoded_size(&self) -> usize {
        let mut size = RECORD_PREFIX_SIZE;
        for field in &self.fields {
            size += field.encoded_size();
        }
        if self.continuation.is_some() {
            size += CONTINUATION_SIZE;
        }
        size
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buff = Vec::with_capacity(self.encoded_size());
        assert!(self.fields.len() <= u16::MAX as usize);
        buff.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        let flags = if self.continuation.is_some() {
            RECORD_FLAG_CONTINUATION
        } else {
            0
        };
        buff.push(flags);

        for field in &self.fields {
            match field {
                Field::Inline(bytes) => {
                    assert!(bytes.len() <= u32::MAX as usize);
                    buff.push(FIELD_MARKER_INLINE);
                    buff.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    buff.extend_from_slice(bytes);
                }
                Field::Long(pgid) => {
                    buff.push(FIELD_MARKER_LONG);
                    buff.extend_from_slice(&pgid.to_be_bytes());
                }
            }
        }

        if let Some((pgid, rid)) = self.continuation {
            buff.extend_from_slice(&pgid.to_be_bytes());
            buff.extend_from_slice(&rid.get().to_be_bytes());
        }

        buff
    }

    pub(crate) fn decode(buff: &[u8]) -> anyhow::Result<Self> {
        if buff.len() < RECORD_PREFIX_SIZE {
            return Err(anyhow!("record payload is shorter than its prefix"));
        }
        let field_count = buff.read_u16() as usize;
        let flags = buff[2];
        let mut offset = RECORD_PREFIX_SIZE;

        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            if offset >= buff.len() {
                return Err(anyhow!("record payload truncated at field marker"));
            }
            let marker = buff[offset];
            offset += 1;
            match marker {
                FIELD_MARKER_INLINE => {
                    if offset + 4 > buff.len() {
                        return Err(anyhow!("record payload truncated at field length"));
                    }
                    let len = buff[offset..].read_u32() as usize;
                    offset += 4;
                    if offset + len > buff.len() {
                        return Err(anyhow!("record payload truncated inside a field"));
                    }
                    fields.push(Field::Inline(buff[offset..offset + len].to_vec()));
                    offset += len;
                }
                FIELD_MARKER_LONG => {
                    if offset + 8 > buff.len() {
                        return Err(anyhow!("record payload truncated at long-column pointer"));
                    }
                    let Some(pgid) = PageId::from_be_bytes(buff[offset..offset + 8].try_into()?)
                    else {
                        return Err(anyhow!("zero page id in long-column pointer"));
                    };
                    offset += 8;
                    fields.push(Field::Long(pgid));
                }
                _ => return Err(anyhow!("unknown field marker {marker}")),
            }
        }

        let continuation = if flags & RECORD_FLAG_CONTINUATION != 0 {
            if offset + CONTINUATION_SIZE > buff.len() {
                return Err(anyhow!("record payload truncated at continuation pointer"));
            }
            let Some(pgid) = PageId::from_be_bytes(buff[offset..offset + 8].try_into()?) else {
                return Err(anyhow!("zero page id in continuation pointer"));
            };
            let rid = RecordId::new(buff[offset + 8..].read_u32());
            Some((pgid, rid))
        } else {
            None
        };

        Ok(Self {
            fields,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let payload = RecordPayload {
            fields: vec![
                Field::Inline(b"hello".to_vec()),
                Field::Inline(vec![]),
                Field::Long(PageId::new(7).unwrap()),
                Field::Inline(vec![0xab; 300]),
            ],
            continuation: Some((PageId::new(9).unwrap(), RecordId::new(42))),
        };

        let encoded = payload.encode();
        assert_eq!(encoded.len(), payload.encoded_size());
        let decoded = RecordPayload::decode(&encoded).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_payload_rejects_truncation() {
        let payload = RecordPayload::inline(&[b"abcdef".to_vec()]);
        let encoded = payload.encode();
        for cut in 1..encoded.len() {
            assert!(RecordPayload::decode(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn test_zero_filled_payload_decodes_empty() {
        // Purge rollback without logged data reinserts zero bytes; they
        // must still parse as a (columnless) record.
        let decoded = RecordPayload::decode(&[0u8; 64]).unwrap();
        assert!(decoded.fields.is_empty());
        assert!(decoded.continuation.is_none());
    }
}
