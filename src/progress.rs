//! Download progress reporting for entry fetches.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Default number of bytes between two progress callbacks (64 KiB)
pub const DEFAULT_BUFFER_SIZE: u64 = 0xFFFF;

/// Progress callback for an entry fetch.
///
/// The callback receives values in `(0, 1]`, strictly increasing, and is
/// called with `1.0` exactly once when the payload has been verified.
/// Intermediate values are reported at most once per `buffer_size` bytes
/// received, so entries smaller than the buffer only report completion.
///
/// Cheap to clone; clones share the callback and the last reported value.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    buffer_size: u64,
    callback: Box<dyn Fn(f64) + Send + Sync>,
    state: Mutex<ProgressState>,
}

#[derive(Default)]
struct ProgressState {
    reported_bytes: u64,
    value: f64,
}

impl Progress {
    pub fn new(callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE, callback)
    }

    pub fn with_buffer_size(buffer_size: u64, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                buffer_size: buffer_size.max(1),
                callback: Box::new(callback),
                state: Mutex::new(ProgressState::default()),
            }),
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.inner.buffer_size
    }

    /// Record that `received` of `total` bytes have arrived.
    ///
    /// Never reports completion; see [`Progress::finish`].
    pub fn update(&self, received: u64, total: u64) {
        if received >= total {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if received.saturating_sub(state.reported_bytes) < self.inner.buffer_size {
                return;
            }
            state.reported_bytes = received;
        }
        self.report(received as f64 / total as f64);
    }

    /// Report completion
    pub fn finish(&self) {
        self.report(1.0);
    }

    /// Forward `value` to the callback unless it would not increase.
    pub(crate) fn report(&self, value: f64) {
        {
            let mut state = self.inner.state.lock();
            if value <= state.value {
                return;
            }
            state.value = value;
        }
        (self.inner.callback)(value);
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("buffer_size", &self.inner.buffer_size)
            .finish_non_exhaustive()
    }
}
