/// A position inside a fixed-length ring. The value is always in `0..len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    value: usize,
    len: usize,
}

impl RingCursor {
    pub fn new(len: usize) -> RingCursor {
        assert!(len > 0, "ring length must be positive");
        RingCursor { value: 0, len }
    }

    pub fn get(&self) -> usize {
        self.value
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Move forward one slot. Returns true when the cursor wrapped back to 0.
    pub fn advance(&mut self) -> bool {
        self.value += 1;
        if self.value == self.len {
            self.value = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_at_len() {
        let mut c = RingCursor::new(3);
        assert!(!c.advance());
        assert!(!c.advance());
        assert_eq!(c.get(), 2);
        assert!(c.advance());
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn len_one_always_wraps() {
        let mut c = RingCursor::new(1);
        assert!(c.advance());
        assert!(c.advance());
        assert_eq!(c.get(), 0);
    }

    #[test]
    #[should_panic]
    fn zero_len_rejected() {
        RingCursor::new(0);
    }
}
