use serde::{Deserialize, Serialize};

/// Fixed-size bit array indexed by validator index.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BitArray {
    bits: usize,
    elems: Vec<u64>,
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        BitArray {
            bits,
            elems: vec![0; (bits + 63) / 64],
        }
    }

    pub fn size(&self) -> usize {
        self.bits
    }

    pub fn get(&self, i: usize) -> bool {
        if i >= self.bits {
            return false;
        }
        self.elems[i / 64] & (1u64 << (i % 64)) != 0
    }

    /// Returns false if `i` is out of range.
    pub fn set(&mut self, i: usize, v: bool) -> bool {
        if i >= self.bits {
            return false;
        }
        if v {
            self.elems[i / 64] |= 1u64 << (i % 64);
        } else {
            self.elems[i / 64] &= !(1u64 << (i % 64));
        }
        true
    }

    pub fn count_ones(&self) -> usize {
        self.elems.iter().map(|e| e.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.bits
    }

    /// Bits set in `self` but not in `other`.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut out = self.clone();
        for (i, e) in out.elems.iter_mut().enumerate() {
            if let Some(o) = other.elems.get(i) {
                *e &= !o;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_count() {
        let mut bits = BitArray::new(70);
        assert!(bits.set(0, true));
        assert!(bits.set(69, true));
        assert!(!bits.set(70, true));
        assert!(bits.get(69));
        assert!(!bits.get(1));
        assert_eq!(bits.count_ones(), 2);

        let mut other = BitArray::new(70);
        other.set(0, true);
        let diff = bits.sub(&other);
        assert!(!diff.get(0));
        assert!(diff.get(69));
    }
}
