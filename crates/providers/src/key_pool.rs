//! Rotating API-key pool.
//!
//! Keys rotate round-robin per request. A key that fails authentication is
//! demoted for the remainder of the process; when every key is demoted the
//! pool keeps serving them (the provider may have recovered).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use secrecy::Secret;

struct KeySlot {
    key: Secret<String>,
    demoted: AtomicBool,
}

pub struct KeyPool {
    slots: Vec<KeySlot>,
    cursor: AtomicUsize,
}

impl KeyPool {
    #[must_use]
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        Self {
            slots: keys
                .into_iter()
                .map(|key| KeySlot {
                    key,
                    demoted: AtomicBool::new(false),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Next key in rotation, skipping demoted slots when a healthy one
    /// exists. Returns the slot index for later demotion.
    #[must_use]
    pub fn next(&self) -> Option<(usize, &Secret<String>)> {
        if self.slots.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.slots.len() {
            let idx = (start + offset) % self.slots.len();
            let slot = &self.slots[idx];
            if !slot.demoted.load(Ordering::Relaxed) {
                return Some((idx, &slot.key));
            }
        }
        // All demoted: serve round-robin anyway.
        let idx = start % self.slots.len();
        Some((idx, &self.slots[idx].key))
    }

    /// Mark a key as rejected by the provider.
    pub fn demote(&self, idx: usize) {
        if let Some(slot) = self.slots.get(idx) {
            slot.demoted.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> KeyPool {
        KeyPool::new((0..n).map(|i| Secret::new(format!("key-{i}"))).collect())
    }

    #[test]
    fn empty_pool_yields_nothing() {
        assert!(pool(0).next().is_none());
    }

    #[test]
    fn rotation_cycles_keys() {
        use secrecy::ExposeSecret;
        let pool = pool(2);
        let a = pool.next().map(|(_, k)| k.expose_secret().clone());
        let b = pool.next().map(|(_, k)| k.expose_secret().clone());
        assert_ne!(a, b);
    }

    #[test]
    fn demoted_keys_are_skipped_while_healthy_ones_remain() {
        let pool = pool(3);
        pool.demote(0);
        for _ in 0..6 {
            let (idx, _) = pool.next().unwrap();
            assert_ne!(idx, 0);
        }
    }

    #[test]
    fn fully_demoted_pool_still_serves() {
        let pool = pool(2);
        pool.demote(0);
        pool.demote(1);
        assert!(pool.next().is_some());
    }
}
