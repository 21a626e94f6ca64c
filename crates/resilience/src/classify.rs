//! Error classification for retry decisions.

/// Splits failures into the ones worth retrying and the ones that are not.
///
/// Network and rate-limit failures are transient; authentication or
/// authorization denials, malformed input, and lease conflicts are not.
pub trait Classify {
    /// `true` when the same call may succeed if attempted again later.
    fn is_transient(&self) -> bool;
}

impl<T: Classify + ?Sized> Classify for &T {
    fn is_transient(&self) -> bool {
        (**self).is_transient()
    }
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn is_transient(&self) -> bool {
        (**self).is_transient()
    }
}
