/// Runs a closure when dropped, on normal exit, early return or unwind.
///
/// Used to release the runner's driving flag even if a tick panics.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_drop: F) -> Self {
        ScopeGuard {
            on_drop: Some(on_drop),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_runs_on_unwind() {
        let released = Cell::new(false);
        let res = catch_unwind(AssertUnwindSafe(|| {
            let _guard = ScopeGuard::new(|| released.set(true));
            panic!("tick failed");
        }));

        assert!(res.is_err());
        assert!(released.get());
    }

    #[test]
    fn test_runs_once_on_normal_exit() {
        let runs = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| runs.set(runs.get() + 1));
        }
        assert_eq!(runs.get(), 1);
    }
}
