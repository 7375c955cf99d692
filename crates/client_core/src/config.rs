use std::time::Duration;

// Can't go much below ~1.2s while unauthenticated requests share the rate limit.
pub const MESSAGE_POLL_INTERVAL: Duration = Duration::from_millis(1_500);
pub const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const CHANNEL_POLL_INTERVAL: Duration = Duration::from_secs(20);
pub const MESSAGE_PAGE_SIZE: u32 = 20;
pub const DELETION_PAGE_SIZE: usize = 200;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheduling and paging knobs shared by every channel the client polls.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub message_poll_interval: Duration,
    pub deletion_poll_interval: Duration,
    pub channel_poll_interval: Duration,
    /// Messages requested per cycle (newest first).
    pub message_page_size: u32,
    /// Deletions requested per drain iteration. A shorter page ends the drain.
    pub deletion_page_size: usize,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            message_poll_interval: MESSAGE_POLL_INTERVAL,
            deletion_poll_interval: DELETION_POLL_INTERVAL,
            channel_poll_interval: CHANNEL_POLL_INTERVAL,
            message_page_size: MESSAGE_PAGE_SIZE,
            deletion_page_size: DELETION_PAGE_SIZE,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn with_poll_intervals(mut self, messages: Duration, deletions: Duration, channel: Duration) -> Self {
        self.message_poll_interval = messages;
        self.deletion_poll_interval = deletions;
        self.channel_poll_interval = channel;
        self
    }
}
