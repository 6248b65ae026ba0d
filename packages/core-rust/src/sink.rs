//! The progress sink handed to long-running workloads.

/// Receives progress lines from a running workload.
///
/// Implementations must preserve call order and must not coalesce or drop
/// lines while the receiving side is still connected. `send` may be called
/// from a blocking worker thread.
pub trait EventSink: Send + Sync {
    fn send(&self, message: String);
}

impl<F> EventSink for F
where
    F: Fn(String) + Send + Sync,
{
    fn send(&self, message: String) {
        self(message);
    }
}
