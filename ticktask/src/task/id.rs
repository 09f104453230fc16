use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a task handle.
///
/// Pooled handles keep their ID across recycles; a [`TaskRoutine`] keeps its
/// ID across restarts.
///
/// [`TaskRoutine`]: crate::task::TaskRoutine
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Even at a billion handles per second this takes centuries to wrap.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_task_id_unique() {
        let n = 13;
        let all_ids = (0..n).map(|_| Id::next()).collect::<HashSet<_>>();
        assert_eq!(all_ids.len(), n);
    }

    #[test]
    fn test_ids_are_increasing() {
        let a = Id::next();
        let b = Id::next();
        assert!(b > a);
        assert_eq!(a.to_string(), a.as_u64().to_string());
    }
}
