//! Debug-only detection of user hooks calling back into their own table.
//!
//! `prepare_new` and `before_release` run with a shard write lock held, so
//! re-entering the same table from inside a hook deadlocks or corrupts the
//! reclaim protocol. In debug builds the table marks itself current for the
//! duration of a hook invocation and every public entry point asserts it is
//! not the marked table. Release builds compile to a no-op.

use core::cell::Cell;

thread_local! {
    static ACTIVE_HOOK_TABLE: Cell<usize> = const { Cell::new(0) };
}

/// RAII mark set around a user hook invocation.
pub(crate) struct HookGuard {
    #[cfg(debug_assertions)]
    prev: usize,
}

/// Mark `table_addr` as running a hook on this thread.
#[inline]
pub(crate) fn enter_hook(table_addr: usize) -> HookGuard {
    #[cfg(debug_assertions)]
    {
        let prev = ACTIVE_HOOK_TABLE.with(|c| c.replace(table_addr));
        return HookGuard { prev };
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = table_addr;
        HookGuard {}
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        ACTIVE_HOOK_TABLE.with(|c| c.set(self.prev));
    }
}

/// Assert this thread is not inside a hook of the table at `table_addr`.
#[inline]
pub(crate) fn debug_assert_not_reentrant(table_addr: usize) {
    #[cfg(debug_assertions)]
    ACTIVE_HOOK_TABLE.with(|c| {
        assert!(
            c.get() != table_addr,
            "reentrancy detected: user hook called back into its own table"
        );
    });
    #[cfg(not(debug_assertions))]
    let _ = table_addr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_exit_is_ok() {
        let _g = enter_hook(0x1000);
        debug_assert_not_reentrant(0x2000);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn same_table_reentry_panics_in_debug() {
        let res = std::panic::catch_unwind(|| {
            let _g = enter_hook(0x1000);
            debug_assert_not_reentrant(0x1000);
        });
        assert!(res.is_err(), "expected reentry to panic in debug builds");
    }

    #[cfg(debug_assertions)]
    #[test]
    fn mark_is_restored_after_guard_drops() {
        {
            let _g = enter_hook(0x1000);
        }
        debug_assert_not_reentrant(0x1000);
    }
}
