use crate::bins::SliceExt;
use crate::id::{PageId, PageIdExt, RecordId};
use anyhow::anyhow;
use std::cmp::Ordering;

/// A typed index column value. Index rows are `Datum` vectors whose last
/// column is the base-row location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datum {
    Int(i64),
    Bytes(Vec<u8>),
    RowLoc(PageId, RecordId),
}

const DATUM_TAG_INT: u8 = 1;
const DATUM_TAG_BYTES: u8 = 2;
const DATUM_TAG_ROWLOC: u8 = 3;

impl Datum {
    pub(crate) fn encode_column(&self) -> Vec<u8> {
        match self {
            Datum::Int(v) => {
                let mut buff = Vec::with_capacity(9);
                buff.push(DATUM_TAG_INT);
                buff.extend_from_slice(&v.to_be_bytes());
                buff
            }
            Datum::Bytes(bytes) => {
                let mut buff = Vec::with_capacity(1 + bytes.len());
                buff.push(DATUM_TAG_BYTES);
                buff.extend_from_slice(bytes);
                buff
            }
            Datum::RowLoc(pgid, rid) => {
                let mut buff = Vec::with_capacity(13);
                buff.push(DATUM_TAG_ROWLOC);
                buff.extend_from_slice(&pgid.to_be_bytes());
                buff.extend_from_slice(&rid.get().to_be_bytes());
                buff
            }
        }
    }

    pub(crate) fn decode_column(buff: &[u8]) -> anyhow::Result<Self> {
        if buff.is_empty() {
            return Err(anyhow!("empty index column"));
        }
        match buff[0] {
            DATUM_TAG_INT => {
                if buff.len() != 9 {
                    return Err(anyhow!("int column has wrong length {}", buff.len()));
                }
                Ok(Datum::Int(i64::from_be_bytes(buff[1..9].try_into()?)))
            }
            DATUM_TAG_BYTES => Ok(Datum::Bytes(buff[1..].to_vec())),
            DATUM_TAG_ROWLOC => {
                if buff.len() != 13 {
                    return Err(anyhow!("row-location column has wrong length {}", buff.len()));
                }
                let Some(pgid) = PageId::from_be_bytes(buff[1..9].try_into()?) else {
                    return Err(anyhow!("zero page id in row-location column"));
                };
                let rid = RecordId::new(buff[9..].read_u32());
                Ok(Datum::RowLoc(pgid, rid))
            }
            tag => Err(anyhow!("unknown index column tag {tag}")),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Datum::Int(_) => DATUM_TAG_INT,
            Datum::Bytes(_) => DATUM_TAG_BYTES,
            Datum::RowLoc(..) => DATUM_TAG_ROWLOC,
        }
    }

    /// Total order across all datum values. Mixed types order by tag so the
    /// comparison is still total, though a well-formed index never mixes
    /// types within one column.
    pub(crate) fn compare(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            (Datum::RowLoc(ap, ar), Datum::RowLoc(bp, br)) => {
                ap.get().cmp(&bp.get()).then(ar.get().cmp(&br.get()))
            }
            (a, b) => a.tag().cmp(&b.tag()),
        }
    }
}

/// Per-column collation direction of an index key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    #[inline]
    pub(crate) fn apply(&self, ord: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

/// Compares the first `prefix` columns of two index rows under the given
/// per-column directions. Columns beyond the directions slice compare
/// ascending.
pub(crate) fn compare_rows(
    a: &[Datum],
    b: &[Datum],
    directions: &[SortOrder],
    prefix: usize,
) -> Ordering {
    for i in 0..prefix.min(a.len()).min(b.len()) {
        let dir = directions.get(i).copied().unwrap_or(SortOrder::Asc);
        let ord = dir.apply(a[i].compare(&b[i]));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().min(prefix).cmp(&b.len().min(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datum_roundtrip() {
        let values = [
            Datum::Int(-42),
            Datum::Int(i64::MAX),
            Datum::Bytes(b"hello".to_vec()),
            Datum::Bytes(vec![]),
            Datum::RowLoc(PageId::new(3).unwrap(), RecordId::new(7)),
        ];
        for v in &values {
            let encoded = v.encode_column();
            assert_eq!(*v, Datum::decode_column(&encoded).unwrap());
        }
    }

    #[test]
    fn test_compare_rows_directions() {
        let dirs = [SortOrder::Desc, SortOrder::Asc];
        let a = vec![Datum::Int(5), Datum::Int(1)];
        let b = vec![Datum::Int(3), Datum::Int(9)];
        // 5 > 3, but the first column is descending, so a sorts first.
        assert_eq!(Ordering::Less, compare_rows(&a, &b, &dirs, 2));

        let c = vec![Datum::Int(5), Datum::Int(0)];
        assert_eq!(Ordering::Greater, compare_rows(&a, &c, &dirs, 2));
        assert_eq!(Ordering::Equal, compare_rows(&a, &a, &dirs, 2));
    }
}
