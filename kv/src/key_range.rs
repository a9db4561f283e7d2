/// A half-open byte-string key range `[inclusive_min, exclusive_max)`.
///
/// `exclusive_max` of `None` means unbounded (the range extends to the end
/// of the key space).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub inclusive_min: Vec<u8>,
    pub exclusive_max: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(inclusive_min: Vec<u8>, exclusive_max: Vec<u8>) -> Self {
        Self { inclusive_min, exclusive_max: Some(exclusive_max) }
    }

    pub fn starting_at(inclusive_min: Vec<u8>) -> Self {
        Self { inclusive_min, exclusive_max: None }
    }

    pub fn empty_between(key: Vec<u8>) -> Self {
        let exclusive_max = successor(&key);
        Self { inclusive_min: key, exclusive_max: Some(exclusive_max) }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.inclusive_min.as_slice()
            && match &self.exclusive_max {
                Some(max) => key < max.as_slice(),
                None => true,
            }
    }

    pub fn is_empty(&self) -> bool {
        match &self.exclusive_max {
            Some(max) => max <= &self.inclusive_min,
            None => false,
        }
    }

    /// Whether `self` and `other` overlap (share at least one key).
    pub fn intersects(&self, other: &KeyRange) -> bool {
        let lo_ok = match &other.exclusive_max {
            Some(max) => &self.inclusive_min < max,
            None => true,
        };
        let hi_ok = match &self.exclusive_max {
            Some(max) => &other.inclusive_min < max,
            None => true,
        };
        lo_ok && hi_ok
    }

    /// The smallest range containing both `self` and `other`. Only
    /// meaningful when the two ranges are adjacent or overlapping.
    pub fn union(&self, other: &KeyRange) -> KeyRange {
        let inclusive_min = std::cmp::min(&self.inclusive_min, &other.inclusive_min).clone();
        let exclusive_max = match (&self.exclusive_max, &other.exclusive_max) {
            (Some(a), Some(b)) => Some(std::cmp::max(a, b).clone()),
            _ => None,
        };
        KeyRange { inclusive_min, exclusive_max }
    }
}

/// The lexicographically smallest key strictly greater than `key` that
/// shares no prefix constraint with it other than ordering; used to build
/// an exclusive upper bound for a single-key range.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_respects_half_open_bound() {
        let r = KeyRange::new(b"a".to_vec(), b"c".to_vec());
        assert!(r.contains(b"a"));
        assert!(r.contains(b"b"));
        assert!(!r.contains(b"c"));
    }

    #[test]
    fn unbounded_upper_contains_everything_past_min() {
        let r = KeyRange::starting_at(b"m".to_vec());
        assert!(r.contains(b"zzzz"));
        assert!(!r.contains(b"a"));
    }

    #[test]
    fn intersects_detects_overlap_and_disjoint() {
        let a = KeyRange::new(b"a".to_vec(), b"m".to_vec());
        let b = KeyRange::new(b"k".to_vec(), b"z".to_vec());
        let c = KeyRange::new(b"m".to_vec(), b"z".to_vec());
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }
}
