/// Field values and storage attributes.
///
/// A field value is the content of one cell of a record. Each field has a
/// storage attribute specifying how values are held in memory and how they
/// are laid out on the wire.
///
/// # Numeric buffers
///
/// NUMERIC, DATE and TIME values travel as fixed-width significant-digit
/// buffers whose encoding belongs to the codec layer. The engine treats
/// them as opaque `NumBuf`s: byte order equals numeric order, so sorting
/// and range tests never decode them.

use std::cmp::Ordering;
use std::fmt;

/// Field storage attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAttr {
    Alpha,
    Unicode,
    Blob,
    Numeric,
    Date,
    Time,
    Boolean,
}

impl StorageAttr {
    /// Parse the one-letter wire form
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "A" => Some(StorageAttr::Alpha),
            "U" => Some(StorageAttr::Unicode),
            "B" => Some(StorageAttr::Blob),
            "N" => Some(StorageAttr::Numeric),
            "D" => Some(StorageAttr::Date),
            "T" => Some(StorageAttr::Time),
            "L" => Some(StorageAttr::Boolean),
            _ => None,
        }
    }

    /// Returns true for attributes encoded as length-prefixed segments
    pub fn is_segmented(&self) -> bool {
        matches!(self, StorageAttr::Alpha | StorageAttr::Unicode | StorageAttr::Blob)
    }

    /// Returns true for attributes carried as fixed-width numeric buffers
    pub fn is_numeric(&self) -> bool {
        matches!(self, StorageAttr::Numeric | StorageAttr::Date | StorageAttr::Time)
    }
}

/// Fixed-width, order-preserving numeric buffer.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NumBuf(Vec<u8>);

impl NumBuf {
    /// Width used by `from_i64`
    pub const I64_WIDTH: usize = 8;

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        NumBuf(bytes)
    }

    /// Big-endian with the sign bit flipped, so byte order equals numeric order.
    pub fn from_i64(value: i64) -> Self {
        let biased = (value as u64) ^ (1u64 << 63);
        NumBuf(biased.to_be_bytes().to_vec())
    }

    pub fn as_i64(&self) -> Option<i64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some((u64::from_be_bytes(bytes) ^ (1u64 << 63)) as i64)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// The value 0 at the given width: sign byte set, every other byte
    /// clear. At `I64_WIDTH` this equals `from_i64(0)`.
    pub fn zero(width: usize) -> Self {
        let mut bytes = vec![0; width];
        if let Some(sign) = bytes.first_mut() {
            *sign = 0x80;
        }
        NumBuf(bytes)
    }
}

impl PartialOrd for NumBuf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NumBuf {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for NumBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_i64() {
            Some(v) => write!(f, "NumBuf({})", v),
            None => write!(f, "NumBuf({:02X?})", self.0),
        }
    }
}

/// Field value enum covering every storage attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Alpha(String),
    Unicode(String),
    Blob(Vec<u8>),
    /// NUMERIC, DATE and TIME
    Numeric(NumBuf),
    Boolean(bool),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Convenience for numeric fields holding integers
    pub fn numeric(value: i64) -> Self {
        FieldValue::Numeric(NumBuf::from_i64(value))
    }

    pub fn alpha(value: impl Into<String>) -> Self {
        FieldValue::Alpha(value.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Alpha(s) | FieldValue::Unicode(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Numeric(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// The zero value of a storage attribute, used when a null is encoded
    /// and as the fallback default of non-nullable fields.
    pub fn zero_of(attr: StorageAttr, size: usize) -> FieldValue {
        match attr {
            StorageAttr::Alpha => FieldValue::Alpha(String::new()),
            StorageAttr::Unicode => FieldValue::Unicode(String::new()),
            StorageAttr::Blob => FieldValue::Blob(Vec::new()),
            StorageAttr::Numeric | StorageAttr::Date | StorageAttr::Time => {
                FieldValue::Numeric(NumBuf::zero(size))
            }
            StorageAttr::Boolean => FieldValue::Boolean(false),
        }
    }

    /// Returns true if the value can be held by a field of the given attribute
    pub fn fits(&self, attr: StorageAttr) -> bool {
        match (self, attr) {
            (FieldValue::Null, _) => true,
            (FieldValue::Alpha(_), StorageAttr::Alpha) => true,
            (FieldValue::Unicode(_), StorageAttr::Unicode) => true,
            (FieldValue::Blob(_), StorageAttr::Blob) => true,
            (FieldValue::Numeric(_), a) => a.is_numeric(),
            (FieldValue::Boolean(_), StorageAttr::Boolean) => true,
            _ => false,
        }
    }

    /// Total order used by resident-table keys: a null compares greater
    /// than any non-null value.
    pub fn key_cmp(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Null, _) => Ordering::Greater,
            (_, FieldValue::Null) => Ordering::Less,
            (FieldValue::Alpha(a), FieldValue::Alpha(b))
            | (FieldValue::Unicode(a), FieldValue::Unicode(b))
            | (FieldValue::Alpha(a), FieldValue::Unicode(b))
            | (FieldValue::Unicode(a), FieldValue::Alpha(b)) => a.cmp(b),
            (FieldValue::Blob(a), FieldValue::Blob(b)) => a.cmp(b),
            (FieldValue::Numeric(a), FieldValue::Numeric(b)) => a.cmp(b),
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => a.cmp(b),
            // Mixed attributes - compare by variant rank for a deterministic order
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            FieldValue::Alpha(_) => 0,
            FieldValue::Unicode(_) => 1,
            FieldValue::Blob(_) => 2,
            FieldValue::Numeric(_) => 3,
            FieldValue::Boolean(_) => 4,
            FieldValue::Null => 5,
        }
    }
}

/// Truncate a string to a declared field size.
///
/// In a double-byte locale every non-ASCII character takes two bytes of the
/// declared size, so a character that would straddle the limit is dropped.
pub fn truncate_to_size(s: &str, size: usize, double_byte: bool) -> String {
    if !double_byte {
        return s.chars().take(size).collect();
    }

    let mut used = 0;
    let mut out = String::new();
    for c in s.chars() {
        let width = if c.is_ascii() { 1 } else { 2 };
        if used + width > size {
            break;
        }
        used += width;
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbuf_order_preserving() {
        let values = [-100i64, -1, 0, 3, 5, 8, i64::MAX];
        for pair in values.windows(2) {
            let a = NumBuf::from_i64(pair[0]);
            let b = NumBuf::from_i64(pair[1]);
            assert!(a < b, "{} should sort before {}", pair[0], pair[1]);
        }
        assert_eq!(NumBuf::from_i64(-42).as_i64(), Some(-42));
    }

    #[test]
    fn test_numeric_default_is_zero() {
        let zero = FieldValue::zero_of(StorageAttr::Numeric, 8);
        assert_eq!(zero.as_i64(), Some(0));
        assert_eq!(zero, FieldValue::numeric(0));
        assert_eq!(zero.key_cmp(&FieldValue::numeric(-5)), Ordering::Greater);
        assert_eq!(zero.key_cmp(&FieldValue::numeric(5)), Ordering::Less);

        let narrow = NumBuf::zero(4);
        assert_eq!(narrow.as_bytes(), &[0x80, 0, 0, 0]);
        assert!(NumBuf::zero(0).as_bytes().is_empty());
    }

    #[test]
    fn test_null_sorts_last() {
        let null = FieldValue::Null;
        let three = FieldValue::numeric(3);
        assert_eq!(null.key_cmp(&three), Ordering::Greater);
        assert_eq!(three.key_cmp(&null), Ordering::Less);
        assert_eq!(null.key_cmp(&FieldValue::Null), Ordering::Equal);
    }

    #[test]
    fn test_fits() {
        assert!(FieldValue::numeric(1).fits(StorageAttr::Date));
        assert!(FieldValue::Null.fits(StorageAttr::Blob));
        assert!(!FieldValue::alpha("x").fits(StorageAttr::Numeric));
    }

    #[test]
    fn test_truncate_double_byte() {
        assert_eq!(truncate_to_size("abcdef", 4, false), "abcd");
        // 'é' counts as two bytes: a(1) é(2) = 3, next 'b' would make 4
        assert_eq!(truncate_to_size("aébc", 3, true), "aé");
        assert_eq!(truncate_to_size("aébc", 2, true), "a");
        assert_eq!(truncate_to_size("日本語", 4, true), "日本");
    }
}
