use rand::Rng;

/// A correlation id, kept within 2^53 so it round-trips through JSON numbers
/// in every WAMP peer implementation (most of which use a JS double).
pub type Id = u64;

const ID_MAX: Id = 1 << 53;
const SEED_MAX: Id = 1 << 24;

/// Allocates outbound request ids for one session's lifetime.
///
/// Seeded randomly so that ids from independently-started sessions talking
/// to the same router are unlikely to collide while connections overlap;
/// incremented monotonically thereafter.
#[derive(Debug)]
pub struct IdAllocator {
    next: Id,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        IdAllocator {
            next: rand::thread_rng().gen_range(0..SEED_MAX),
        }
    }

    /// Builds an allocator with an explicit starting id, for deterministic tests.
    pub fn with_seed(seed: Id) -> IdAllocator {
        IdAllocator { next: seed % ID_MAX }
    }

    pub fn next(&mut self) -> Id {
        let id = self.next;
        self.next = (self.next + 1) % ID_MAX;
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocates_monotonically() {
        let mut ids = IdAllocator::with_seed(41);
        assert_eq!(ids.next(), 41);
        assert_eq!(ids.next(), 42);
        assert_eq!(ids.next(), 43);
    }
}
