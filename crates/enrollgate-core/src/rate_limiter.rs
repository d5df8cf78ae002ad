/// Default per-identity window.
pub const DEFAULT_IDENTITY_WINDOW_SECS: i64 = 300;
/// Default per-identity request cap within the window.
pub const DEFAULT_IDENTITY_MAX: i64 = 3;
/// Default global window, shared by all identities.
pub const DEFAULT_GLOBAL_WINDOW_SECS: i64 = 3600;
/// Default global request cap within the window.
pub const DEFAULT_GLOBAL_MAX: i64 = 3;

/// Sliding-window admission limit over a series of Unix timestamps.
///
/// A request is admitted while fewer than `max` earlier requests fall inside
/// the trailing `window_secs`. Expired timestamps are pruned lazily, only when
/// the series is consulted. A zero or negative `window_secs` or `max` disables
/// the limit: every request is admitted and the series is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub window_secs: i64,
    pub max: i64,
}

impl WindowLimit {
    pub const fn new(window_secs: i64, max: i64) -> Self {
        Self { window_secs, max }
    }

    pub const fn identity_default() -> Self {
        Self::new(DEFAULT_IDENTITY_WINDOW_SECS, DEFAULT_IDENTITY_MAX)
    }

    pub const fn global_default() -> Self {
        Self::new(DEFAULT_GLOBAL_WINDOW_SECS, DEFAULT_GLOBAL_MAX)
    }

    pub fn is_enabled(&self) -> bool {
        self.window_secs > 0 && self.max > 0
    }

    /// Check `history` for series `key` at time `now`, updating it in place.
    ///
    /// On rejection the pruned history is kept without appending `now`, so the
    /// next check sees the pruned state. On admission `now` is appended.
    pub fn allow(&self, key: &str, history: &mut Vec<i64>, now: i64) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let window_start = now - self.window_secs;
        history.retain(|&t| t >= window_start);

        if history.len() as i64 >= self.max {
            tracing::debug!(
                key,
                in_window = history.len(),
                max = self.max,
                window_secs = self.window_secs,
                "rate limit reached"
            );
            return false;
        }

        // Keep the series ascending even if the wall clock stepped backwards.
        let stamp = history.last().map_or(now, |&last| last.max(now));
        history.push(stamp);
        true
    }
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self::identity_default()
    }
}
