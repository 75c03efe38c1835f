//! Single-owner buffer handles passed between pipeline stages.

use crate::compute::{CommandQueue, ContextId};

/// An ownership handle around one piece of pipeline data (a map, a
/// volume, a pose), tagged with the compute context it lives on.
///
/// The pipeline passes these by move: a producing stage either allocates
/// a fresh buffer or, when the caller hands its previous output back,
/// overwrites the backing store in place. Exactly one live owner exists
/// per buffer at any time, which is what makes in-place reuse safe
/// without locking.
///
/// Access is only permitted from the context the value was created on;
/// anything else is a caller bug, not a recoverable condition.
#[derive(Debug)]
pub struct BufferedValue<T> {
    context: ContextId,
    value: T,
}

impl<T> BufferedValue<T> {
    /// Wrap `value` as a buffer owned by `queue`'s context.
    pub fn new(queue: &CommandQueue, value: T) -> Self {
        Self {
            context: queue.context_id(),
            value,
        }
    }

    /// The context this buffer is associated with.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Read access from within the owning context.
    ///
    /// Panics if `queue` is not the queue the value was created on.
    pub fn get(&self, queue: &CommandQueue) -> &T {
        self.check_context(queue);
        &self.value
    }

    /// Write access from within the owning context.
    ///
    /// Panics if `queue` is not the queue the value was created on.
    pub fn get_mut(&mut self, queue: &CommandQueue) -> &mut T {
        self.check_context(queue);
        &mut self.value
    }

    /// Download the value to the host, consuming the handle.
    ///
    /// Waits for all outstanding submissions on `queue` first; this is
    /// the one place a stage's caller blocks on kernel completion.
    pub fn read_back(self, queue: &CommandQueue) -> T {
        self.check_context(queue);
        queue.synchronize();
        self.value
    }

    fn check_context(&self, queue: &CommandQueue) {
        assert_eq!(
            self.context,
            queue.context_id(),
            "buffered value accessed from a foreign compute context"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_tracks_its_queue_context() {
        let q = CommandQueue::new();
        let v = BufferedValue::new(&q, 7);
        assert_eq!(v.context(), q.context_id());
        assert_eq!(*v.get(&q), 7);
    }

    #[test]
    fn test_get_mut_overwrites_in_place() {
        let q = CommandQueue::new();
        let mut v = BufferedValue::new(&q, vec![0u8; 4]);
        v.get_mut(&q)[2] = 9;
        assert_eq!(v.read_back(&q), vec![0, 0, 9, 0]);
    }

    #[test]
    #[should_panic(expected = "foreign compute context")]
    fn test_access_from_foreign_context_panics() {
        let a = CommandQueue::new();
        let b = CommandQueue::new();
        let v = BufferedValue::new(&a, 1);
        let _ = v.get(&b);
    }
}
