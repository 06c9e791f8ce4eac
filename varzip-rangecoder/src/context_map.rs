//! Open-addressing map from a 64-bit context to an owned model.
//!
//! The codecs key thousands of small adaptive models by context words they
//! assemble on the fly. The map owns every model and hands out `&mut`
//! borrows for the duration of one encode/decode step; models live exactly
//! as long as the map.
//!
//! Linear probing over a power-of-two table, murmur-style finalizer, 0.6
//! maximum load factor. There are no deletions.

/// Maximum load factor before the table doubles.
const MAX_FILL_FACTOR: f64 = 0.6;

/// Initial table capacity (power of two).
const INITIAL_CAPACITY: usize = 1 << 5;

/// Context-keyed model store.
#[derive(Debug)]
pub struct ContextMap<M> {
    data: Vec<Option<(u64, Box<M>)>>,
    size: usize,
    size_when_restruct: usize,
    mask: u64,
}

impl<M> Default for ContextMap<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ContextMap<M> {
    /// Create an empty map.
    pub fn new() -> Self {
        let mut data = Vec::new();
        data.resize_with(INITIAL_CAPACITY, || None);
        Self {
            data,
            size: 0,
            size_when_restruct: (INITIAL_CAPACITY as f64 * MAX_FILL_FACTOR) as usize,
            mask: (INITIAL_CAPACITY - 1) as u64,
        }
    }

    // Murmur64 finalizer.
    #[inline]
    fn hash(&self, ctx: u64) -> usize {
        let mut h = ctx;
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
        h ^= h >> 33;
        h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        h ^= h >> 33;
        (h & self.mask) as usize
    }

    fn restruct(&mut self) {
        let old = std::mem::take(&mut self.data);
        let capacity = (self.mask as usize + 1) * 2;

        self.data.resize_with(capacity, || None);
        self.mask = (capacity - 1) as u64;
        self.size_when_restruct = (capacity as f64 * MAX_FILL_FACTOR) as usize;
        self.size = 0;

        for slot in old.into_iter().flatten() {
            self.insert_slot(slot.0, slot.1);
        }
    }

    fn insert_slot(&mut self, ctx: u64, model: Box<M>) {
        let mut h = self.hash(ctx);
        while self.data[h].is_some() {
            h = (h + 1) & self.mask as usize;
        }
        self.data[h] = Some((ctx, model));
        self.size += 1;
    }

    /// Find the model for `ctx`, if present.
    pub fn find(&mut self, ctx: u64) -> Option<&mut M> {
        let mut h = self.hash(ctx);

        loop {
            match &self.data[h] {
                None => return None,
                Some((c, _)) if *c == ctx => {
                    // Re-borrow mutably once the slot is known.
                    return self.data[h].as_mut().map(|(_, m)| m.as_mut());
                }
                Some(_) => h = (h + 1) & self.mask as usize,
            }
        }
    }

    /// Get the model for `ctx`, creating it with `make` on first use.
    pub fn get_or_insert_with(&mut self, ctx: u64, make: impl FnOnce() -> M) -> &mut M {
        if self.size >= self.size_when_restruct {
            self.restruct();
        }

        let mut h = self.hash(ctx);
        loop {
            match &self.data[h] {
                Some((c, _)) if *c == ctx => break,
                Some(_) => h = (h + 1) & self.mask as usize,
                None => {
                    self.data[h] = Some((ctx, Box::new(make())));
                    self.size += 1;
                    break;
                }
            }
        }

        self.data[h].as_mut().map(|(_, m)| m.as_mut()).unwrap()
    }

    /// Hint the CPU that `ctx`'s slot is about to be touched.
    #[inline]
    pub fn prefetch(&self, ctx: u64) {
        let h = self.hash(ctx);
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
            _mm_prefetch(self.data.as_ptr().add(h).cast::<i8>(), _MM_HINT_T0);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = h;
    }

    /// Number of stored models.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when no model has been created yet.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl<M: Default> ContextMap<M> {
    /// Get the model for `ctx`, default-constructing it on first use.
    pub fn get_or_insert(&mut self, ctx: u64) -> &mut M {
        self.get_or_insert_with(ctx, M::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find() {
        let mut map: ContextMap<u32> = ContextMap::new();
        assert!(map.find(17).is_none());

        *map.get_or_insert(17) = 5;
        *map.get_or_insert(42) = 6;

        assert_eq!(*map.find(17).unwrap(), 5);
        assert_eq!(*map.find(42).unwrap(), 6);
        assert!(map.find(18).is_none());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut map: ContextMap<u64> = ContextMap::new();
        for ctx in 0..10_000u64 {
            *map.get_or_insert(ctx.wrapping_mul(0x9e37_79b9_7f4a_7c15)) = ctx;
        }
        assert_eq!(map.len(), 10_000);
        for ctx in 0..10_000u64 {
            let key = ctx.wrapping_mul(0x9e37_79b9_7f4a_7c15);
            assert_eq!(*map.find(key).unwrap(), ctx);
        }
    }

    #[test]
    fn test_get_or_insert_is_idempotent() {
        let mut map: ContextMap<Vec<u8>> = ContextMap::new();
        map.get_or_insert(1).push(9);
        map.get_or_insert(1).push(10);
        assert_eq!(map.find(1).unwrap().as_slice(), &[9, 10]);
        assert_eq!(map.len(), 1);
    }
}
