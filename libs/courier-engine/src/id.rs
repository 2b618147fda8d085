use std::sync::atomic::{AtomicU64, Ordering};

/// Issues message ids. Every id is strictly greater than all ids returned
/// before it, across every subject.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after the highest id a durable backend already holds.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn starts_at_one() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn resumes_after_stored_id() {
        let ids = IdGenerator::starting_after(41);
        assert_eq!(ids.next_id(), 42);
    }

    #[test]
    fn concurrent_callers_never_share_an_id() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || {
                    let mut seen = Vec::with_capacity(1000);
                    let mut prev = 0;
                    for _ in 0..1000 {
                        let id = ids.next_id();
                        assert!(id > prev);
                        prev = id;
                        seen.push(id);
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "id {id} issued twice");
            }
        }
        assert_eq!(all.len(), 8000);
    }
}
