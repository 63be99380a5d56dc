use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on waiting for a `connect-channels` confirmation.
    pub connect_timeout: Duration,
    /// Bound on waiting for a request to go idle.
    pub request_timeout: Duration,
    pub event_buffer: usize,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
