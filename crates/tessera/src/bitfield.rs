//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
///
/// The first bit of the first byte is piece 0, which is the layout of the
/// `bitfield` message on the wire.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    /// A bitfield of `pieces` bits, all unset.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Build a bitfield from the payload of a `bitfield` message.
    ///
    /// The payload must have exactly `ceil(pieces / 8)` bytes, anything else
    /// is rejected. Spare bits at the end are dropped.
    fn from_wire(bytes: &[u8], pieces: usize) -> Option<Bitfield> {
        if bytes.len() != pieces.div_ceil(8) {
            return None;
        }
        let mut bitfield = Bitfield::from_slice(bytes);
        bitfield.truncate(pieces);
        Some(bitfield)
    }

    /// If the bit of `index` is set, out of range is false.
    fn has(&self, index: usize) -> bool;

    /// Indices of the set bits that are not set in `other`.
    fn missing_in(&self, other: &Bitfield) -> Vec<usize>;
}

impl BitfieldExt for Bitfield {
    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn missing_in(&self, other: &Bitfield) -> Vec<usize> {
        self.iter_ones().filter(|i| !other.has(*i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.count_ones(), 0);
    }

    #[test]
    fn from_wire() {
        // 0b1010_0000, pieces 0 and 2
        let bitfield = Bitfield::from_wire(&[0xa0], 3).unwrap();
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(2));
        assert!(!bitfield.has(3));

        let bitfield = Bitfield::from_wire(&[0xff, 0x80], 9).unwrap();
        assert_eq!(bitfield.count_ones(), 9);
    }

    #[test]
    fn from_wire_wrong_len() {
        assert!(Bitfield::from_wire(&[0xff], 9).is_none());
        assert!(Bitfield::from_wire(&[0xff, 0xff], 8).is_none());
        assert!(Bitfield::from_wire(&[], 0).is_some());
    }

    #[test]
    fn missing_in() {
        let mut theirs = Bitfield::from_piece(4);
        theirs.set(1, true);
        theirs.set(3, true);

        let mut ours = Bitfield::from_piece(4);
        ours.set(1, true);

        assert_eq!(theirs.missing_in(&ours), vec![3]);
        assert!(ours.missing_in(&theirs).is_empty());
    }
}
