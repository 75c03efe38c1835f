//! In-order command queue for stage kernel dispatch.
//!
//! Every stage is constructed against one `CommandQueue` and submits its
//! kernels there. Submissions on the same queue complete in submission
//! order, so a stage may rely on its own earlier kernels having finished
//! before a later stage consumes their output, as long as both run on the
//! same queue. Crossing queues requires waiting on a [`Fence`].
//!
//! This is the CPU backend: a kernel body runs to completion inside
//! [`CommandQueue::enqueue`], parallelised internally with rayon where the
//! stage chooses to. In-order semantics therefore hold trivially and every
//! fence is already signalled by the time it is created. The API keeps the
//! submission/fence/synchronize shape so stages are written against the
//! asynchronous contract, not the backend.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// Identity of a compute context. Two queues never share a `ContextId`.
///
/// Buffers are tagged with the context they were allocated against;
/// touching a buffer from a foreign context is a caller bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A point in a queue's submission order.
///
/// Obtained from [`CommandQueue::fence`] after submitting work; passing it
/// to [`CommandQueue::wait`] blocks until everything submitted before the
/// fence has completed.
#[derive(Debug, Clone, Copy)]
pub struct Fence {
    context: ContextId,
    ticket: u64,
}

/// An in-order kernel submission queue bound to one compute context.
pub struct CommandQueue {
    id: ContextId,
    submitted: AtomicU64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            submitted: AtomicU64::new(0),
        }
    }

    /// The identity of the context this queue is bound to.
    pub fn context_id(&self) -> ContextId {
        self.id
    }

    /// Submit one kernel. Kernels submitted earlier on this queue have
    /// completed before `body` observes any of their outputs.
    pub fn enqueue(&self, label: &str, body: impl FnOnce()) {
        let ticket = self.submitted.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(label, ticket, "enqueue kernel");
        body();
    }

    /// A fence covering everything submitted so far.
    pub fn fence(&self) -> Fence {
        Fence {
            context: self.id,
            ticket: self.submitted.load(Ordering::Relaxed),
        }
    }

    /// Block until all work covered by `fence` has completed.
    ///
    /// Panics if the fence belongs to a different queue.
    pub fn wait(&self, fence: &Fence) {
        assert_eq!(
            fence.context, self.id,
            "fence waited on a queue it was not created from"
        );
        debug_assert!(fence.ticket <= self.submitted.load(Ordering::Relaxed));
    }

    /// Block until every submission on this queue has completed.
    ///
    /// This is the host-side readback barrier: call it before downloading
    /// buffer contents produced by enqueued kernels.
    pub fn synchronize(&self) {
        let fence = self.fence();
        self.wait(&fence);
    }

    /// Number of kernels submitted over the queue's lifetime.
    pub fn submission_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_unique() {
        let a = CommandQueue::new();
        let b = CommandQueue::new();
        assert_ne!(a.context_id(), b.context_id());
    }

    #[test]
    fn test_enqueue_runs_in_submission_order() {
        let q = CommandQueue::new();
        let mut order = Vec::new();
        q.enqueue("first", || order.push(1));
        q.enqueue("second", || order.push(2));
        q.enqueue("third", || order.push(3));
        q.synchronize();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(q.submission_count(), 3);
    }

    #[test]
    fn test_fence_covers_prior_submissions() {
        let q = CommandQueue::new();
        q.enqueue("work", || {});
        let fence = q.fence();
        q.wait(&fence);
    }

    #[test]
    #[should_panic(expected = "fence waited on a queue")]
    fn test_wait_rejects_foreign_fence() {
        let a = CommandQueue::new();
        let b = CommandQueue::new();
        let fence = a.fence();
        b.wait(&fence);
    }
}
