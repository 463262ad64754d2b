use serde::{Deserialize, Serialize};

/// A byte range into the source text of one command body.
///
/// Bodies arrive already parsed, so spans are optional metadata: the
/// frontend attaches them when it still has the text around.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn is_dummy(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start as usize..self.end as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_covers_both() {
        let merged = Span::new(4, 9).merge(Span::new(1, 6));
        assert_eq!(merged, Span::new(1, 9));
        assert_eq!(merged.range(), 1..9);
    }

    #[test]
    fn test_dummy() {
        assert!(Span::dummy().is_dummy());
        assert!(!Span::new(0, 1).is_dummy());
    }
}
