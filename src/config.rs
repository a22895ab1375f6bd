use std::time::Duration;

/// Retry loop settings shared by every call of a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    max_total_attempts: u32,
    response_timeout_for_each_attempt: Option<Duration>,
    total_timeout: Option<Duration>,
    use_retry_after: bool,
}

impl RetryConfig {
    pub fn standard() -> Self {
        Self {
            max_total_attempts: 10,
            response_timeout_for_each_attempt: None,
            total_timeout: None,
            use_retry_after: true,
        }
    }

    /// Clamped to at least one attempt.
    pub fn max_total_attempts(mut self, max_total_attempts: u32) -> Self {
        self.max_total_attempts = max_total_attempts.max(1);
        self
    }

    /// Bounds each attempt up to the retry decision. Zero disables it.
    ///
    /// The body of the response handed to the caller streams without this bound;
    /// set a total timeout to cap it.
    pub fn response_timeout_for_each_attempt(mut self, timeout: Duration) -> Self {
        self.response_timeout_for_each_attempt = non_zero(timeout);
        self
    }

    /// Zero disables the overall deadline.
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = non_zero(timeout);
        self
    }

    pub fn use_retry_after(mut self, use_retry_after: bool) -> Self {
        self.use_retry_after = use_retry_after;
        self
    }

    pub fn configured_max_total_attempts(&self) -> u32 {
        self.max_total_attempts
    }

    pub fn configured_response_timeout(&self) -> Option<Duration> {
        self.response_timeout_for_each_attempt
    }

    pub fn configured_total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    pub fn uses_retry_after(&self) -> bool {
        self.use_retry_after
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::standard()
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
