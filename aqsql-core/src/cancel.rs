use std::sync::{Arc, Weak};

/// A liveness token: the Rust stand-in for the weak-observer pattern the
/// original library used for both "receiver guards" (is the object that
/// asked for a callback still alive?) and "cancellable markers" (has the
/// caller abandoned this query?).
///
/// The owner holds a `CancelToken` (or simply drops it to cancel); anything
/// that wants to check liveness without keeping the owner alive holds the
/// [`Weak`](CancelToken::weak) handle and calls [`CancelToken::is_live`] on
/// it. There is no explicit cancel operation — dropping the token *is* the
/// cancellation, exactly as `spec.md` §5 describes.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<()>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(()))
    }

    pub fn weak(&self) -> WeakCancelToken {
        WeakCancelToken(Arc::downgrade(&self.0))
    }
}

/// A weak reference to a [`CancelToken`]. Dead once every `CancelToken`
/// clone sharing its allocation has been dropped.
#[derive(Clone)]
pub struct WeakCancelToken(Weak<()>);

impl WeakCancelToken {
    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_token_dies_with_owner() {
        let token = CancelToken::new();
        let weak = token.weak();
        assert!(weak.is_live());
        drop(token);
        assert!(!weak.is_live());
    }
}
