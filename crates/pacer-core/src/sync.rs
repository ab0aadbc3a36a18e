use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock ignoring poisoning; guarded state is always left consistent
/// before any user code runs.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
