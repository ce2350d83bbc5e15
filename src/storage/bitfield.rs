//! Fixed-length bit field
//!
//! Bits are numbered from the high bit of the first byte, matching the
//! wire encoding of the `bitfield` message.

use anyhow::Result;

use crate::error::TorrentError;

/// Fixed bit-length field with a cached count of set bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bits: Vec<u8>,
    len: usize,
    count: usize,
}

impl BitField {
    /// Create an all-clear field of `len` bits
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
            count: 0,
        }
    }

    /// Create an all-set field of `len` bits
    pub fn full(len: usize) -> Self {
        let mut field = Self::new(len);
        for i in 0..len {
            field.set(i, true);
        }
        field
    }

    /// Parse a received bitfield payload.
    ///
    /// The payload must be exactly `ceil(len / 8)` bytes with zero spare bits.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_violation_field(
                format!("Bitfield has {} bytes, expected {}", bytes.len(), expected),
                "bitfield",
            ).into());
        }

        let spare = expected * 8 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::protocol_violation_at(
                    "Bitfield has spare bits set",
                    "bitfield",
                    expected - 1,
                ).into());
            }
        }

        let count = bytes.iter().map(|b| b.count_ones() as usize).sum();
        Ok(Self {
            bits: bytes.to_vec(),
            len,
            count,
        })
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the field has zero bits
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `index`; out-of-range reads are false
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Write bit `index`, returning whether it changed
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        if index >= self.len || self.get(index) == value {
            return false;
        }
        let mask = 0x80 >> (index % 8);
        if value {
            self.bits[index / 8] |= mask;
            self.count += 1;
        } else {
            self.bits[index / 8] &= !mask;
            self.count -= 1;
        }
        true
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
        self.count = 0;
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        self.count
    }

    pub fn any_set(&self) -> bool {
        self.count > 0
    }

    pub fn all_set(&self) -> bool {
        self.count == self.len
    }

    /// Iterate over the indices of set bits
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// Wire encoding
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_order() {
        let mut field = BitField::new(10);
        field.set(0, true);
        field.set(9, true);
        assert_eq!(field.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert_eq!(field.count_set(), 2);
    }

    #[test]
    fn test_set_reports_change() {
        let mut field = BitField::new(4);
        assert!(field.set(2, true));
        assert!(!field.set(2, true));
        assert_eq!(field.count_set(), 1);
        assert!(field.set(2, false));
        assert!(!field.any_set());
        assert!(!field.set(7, true));
    }

    #[test]
    fn test_full_and_all_set() {
        let field = BitField::full(11);
        assert!(field.all_set());
        assert_eq!(field.as_bytes(), &[0xFF, 0b1110_0000]);
    }

    #[test]
    fn test_from_bytes_rejects_spare_bits() {
        assert!(BitField::from_bytes(&[0xFF, 0b1110_0000], 11).is_ok());
        assert!(BitField::from_bytes(&[0xFF, 0b1111_0000], 11).is_err());
        assert!(BitField::from_bytes(&[0xFF], 11).is_err());
    }

    #[test]
    fn test_iter_set() {
        let field = BitField::from_bytes(&[0b0101_0000], 4).unwrap();
        assert_eq!(field.iter_set().collect::<Vec<_>>(), vec![1, 3]);
    }
}
