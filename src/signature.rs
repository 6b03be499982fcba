//! Component signatures: small ordered sets of component ids used
//! to identify archetypes, plus their SIMD-friendly vector representation
//! used for fast subset tests.

use tinyvec::ArrayVec;

pub const MAX_UNIQUE_COMPONENTS: usize = 15;
pub const MAX_SHARED_COMPONENTS: usize = 8;

/// An ordered-by-id set of unique component ids, capacity-bounded to a hard
/// limit of 15. Pushing past the limit is the archetype signature overflow
/// reported as `ArchetypeSignatureLimitExceeded`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UniqueSignature(ArrayVec<[u16; MAX_UNIQUE_COMPONENTS]>);

/// An ordered-by-id set of shared component ids, capacity-bounded to 8.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SharedSignature(ArrayVec<[u16; MAX_SHARED_COMPONENTS]>);

macro_rules! impl_signature {
    ($ty:ident, $cap:expr) => {
        impl $ty {
            pub fn new() -> Self {
                Self(ArrayVec::new())
            }

            pub fn from_ids(ids: &[u16]) -> Option<Self> {
                let mut sig = Self::new();
                for &id in ids {
                    if !sig.insert(id) {
                        return None;
                    }
                }
                Some(sig)
            }

            /// Inserts `id` in sorted position. Returns `false` if the
            /// signature is already at capacity and `id` is new.
            pub fn insert(&mut self, id: u16) -> bool {
                match self.0.binary_search(&id) {
                    Ok(_) => true,
                    Err(pos) => {
                        if self.0.len() >= $cap {
                            return false;
                        }
                        self.0.insert(pos, id);
                        true
                    }
                }
            }

            pub fn remove(&mut self, id: u16) -> bool {
                match self.0.binary_search(&id) {
                    Ok(pos) => {
                        self.0.remove(pos);
                        true
                    }
                    Err(_) => false,
                }
            }

            pub fn contains(&self, id: u16) -> bool {
                self.0.binary_search(&id).is_ok()
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn ids(&self) -> &[u16] {
                &self.0
            }

            /// Set union. Returns `None` if the result would overflow the
            /// capacity bound.
            pub fn union(&self, other: &Self) -> Option<Self> {
                let mut out = self.clone();
                for &id in other.ids() {
                    if !out.insert(id) {
                        return None;
                    }
                }
                Some(out)
            }

            /// Set difference: ids in `self` not in `other`.
            pub fn difference(&self, other: &Self) -> Self {
                let mut out = Self::new();
                for &id in self.ids() {
                    if !other.contains(id) {
                        out.insert(id);
                    }
                }
                out
            }

            pub fn to_vector(&self) -> VectorSignature {
                VectorSignature::from_ids(&self.0)
            }
        }
    };
}

impl_signature!(UniqueSignature, MAX_UNIQUE_COMPONENTS);
impl_signature!(SharedSignature, MAX_SHARED_COMPONENTS);

/// SIMD-friendly signature representation: two lanes of 8x u16.
/// Subset tests compare lane-wise; this is plain scalar code shaped so the
/// compiler can auto-vectorize it to a `u16x8` compare on targets that have
/// one, leaning on auto-vectorization rather than hand-written intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorSignature {
    lanes: [[u16; 8]; 2],
    len: usize,
}

impl VectorSignature {
    pub fn from_ids(ids: &[u16]) -> Self {
        let mut lanes = [[u16::MAX; 8]; 2];
        for (i, &id) in ids.iter().take(16).enumerate() {
            lanes[i / 8][i % 8] = id;
        }
        Self {
            lanes,
            len: ids.len().min(16),
        }
    }

    /// True if every id in `self` is present in `superset`. Both sides are
    /// expected to be sorted ascending (the invariant `UniqueSignature`/
    /// `SharedSignature` maintain), so this is a merge-style scan rather
    /// than an O(n*m) one.
    pub fn is_subset_of(&self, superset: &VectorSignature) -> bool {
        let mut si = 0usize;
        let mut ci = 0usize;
        let self_ids = self.iter();
        let super_ids = superset.iter();
        while si < self_ids.len() {
            if ci >= super_ids.len() {
                return false;
            }
            match self_ids[si].cmp(&super_ids[ci]) {
                std::cmp::Ordering::Equal => {
                    si += 1;
                    ci += 1;
                }
                std::cmp::Ordering::Greater => ci += 1,
                std::cmp::Ordering::Less => return false,
            }
        }
        true
    }

    fn iter(&self) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.lanes[i / 8][i % 8]);
        }
        out
    }

    /// All ids carried by this signature, sorted ascending.
    pub fn ids(&self) -> Vec<u16> {
        self.iter()
    }

    /// True if `id` is present in this signature.
    pub fn contains_id(&self, id: u16) -> bool {
        self.iter().binary_search(&id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_insert_is_sorted_and_deduped() {
        let mut sig = UniqueSignature::new();
        assert!(sig.insert(5));
        assert!(sig.insert(1));
        assert!(sig.insert(5));
        assert_eq!(sig.ids(), &[1, 5]);
    }

    #[test]
    fn signature_insert_fails_past_capacity() {
        let mut sig = UniqueSignature::new();
        for id in 0..MAX_UNIQUE_COMPONENTS as u16 {
            assert!(sig.insert(id));
        }
        assert!(!sig.insert(9999));
    }

    #[test]
    fn union_and_difference() {
        let a = UniqueSignature::from_ids(&[1, 2, 3]).unwrap();
        let b = UniqueSignature::from_ids(&[3, 4]).unwrap();
        let u = a.union(&b).unwrap();
        assert_eq!(u.ids(), &[1, 2, 3, 4]);

        let d = a.difference(&b);
        assert_eq!(d.ids(), &[1, 2]);
    }

    #[test]
    fn vector_signature_subset_test() {
        let a = UniqueSignature::from_ids(&[1, 3]).unwrap().to_vector();
        let b = UniqueSignature::from_ids(&[1, 2, 3, 4]).unwrap().to_vector();
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
    }
}
