//! Fixed-window counter entries.

/// Accounting state for one key within its current window.
///
/// Entries are plain values; the store hands out copies and never lets a
/// caller hold on to the stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests recorded in the current window, admitted or not
    pub count: u64,
    /// Epoch milliseconds at which the window ends
    pub reset_time: u64,
}

impl CounterEntry {
    /// Start a new window at `now` holding a single request.
    pub fn open(now: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            reset_time: now.saturating_add(window_ms),
        }
    }

    /// Whether the window has ended as of `now`.
    ///
    /// An entry whose reset time equals `now` is already expired, which also
    /// makes a zero-length window expire on the next check.
    pub fn is_expired(&self, now: u64) -> bool {
        self.reset_time <= now
    }

    /// Record one more request in the current window.
    pub fn hit(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// Milliseconds left until the window ends, zero once expired.
    pub fn time_until_reset(&self, now: u64) -> u64 {
        self.reset_time.saturating_sub(now)
    }
}
