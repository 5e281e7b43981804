use anyhow::ensure;

/// Piece possession bitset, most significant bit first as on the wire.
///
/// Unlike the raw wire payload it remembers its piece count, so spare bits
/// in the trailing byte can never masquerade as pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bits: Box<[u8]>,
    len: usize,
}

impl BitField {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8).max(1)].into_boxed_slice(),
            len,
        }
    }

    /// Parses a wire BITFIELD payload. Fails on a size mismatch or on any
    /// set spare bit, both of which are protocol violations.
    pub fn from_wire(raw: &[u8], len: usize) -> anyhow::Result<Self> {
        ensure!(
            raw.len() == len.div_ceil(8).max(1),
            "bitfield payload is {} bytes, expected {} for {} pieces",
            raw.len(),
            len.div_ceil(8).max(1),
            len,
        );
        let this = Self {
            bits: raw.to_vec().into_boxed_slice(),
            len,
        };
        for spare in len..this.bits.len() * 8 {
            ensure!(!this.get_raw(spare), "spare bit {spare} is set");
        }
        Ok(this)
    }

    fn get_raw(&self, index: usize) -> bool {
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.len && self.get_raw(index)
    }

    pub fn set(&mut self, index: usize) {
        assert!(index < self.len, "piece {index} out of {}", self.len);
        self.bits[index / 8] |= 0x80 >> (index % 8);
    }

    pub fn clear(&mut self, index: usize) {
        assert!(index < self.len, "piece {index} out of {}", self.len);
        self.bits[index / 8] &= !(0x80 >> (index % 8));
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    /// Indexes of set pieces, ascending.
    pub fn set_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| self.get_raw(*i))
    }

    /// Indexes of missing pieces, ascending.
    pub fn missing_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| !self.get_raw(*i))
    }

    /// Raw bytes in wire order.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
