//! Definition of errors.

use std::error::Error;
use std::fmt;

/// Returned by `LockFreeQueue::try_enqueue` when a node or the value box could not be
/// allocated. The rejected value is handed back to the caller.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct AllocError<T>(pub T);

impl<T> AllocError<T> {
    /// Take back the value which could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("AllocError(..)")
    }
}

impl<T> fmt::Display for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

impl<T> Error for AllocError<T> {}

#[cfg(test)]
mod test {

    #[test]
    fn test_base() {
        use error::AllocError;

        let e = AllocError(7);
        assert_eq!(format!("{}", e), "memory allocation failed");
        assert_eq!(format!("{:?}", e), "AllocError(..)");
        assert_eq!(e.into_inner(), 7);
    }
}
