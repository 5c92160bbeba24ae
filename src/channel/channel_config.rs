use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// human readable name, used for logging
    pub name: String,
    pub url: String,

    /// an unacknowledged message is retransmitted once it was last sent longer ago than this
    pub resend_threshold: Duration,
    /// how often the unacknowledged set is checked for messages that are due for retransmission
    pub resend_sweep_interval: Duration,
    /// upper bound for writing a single frame to the socket
    pub transmit_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> ChannelConfig {
        ChannelConfig {
            name: name.into(),
            url: url.into(),
            resend_threshold: Duration::from_millis(1000),
            resend_sweep_interval: Duration::from_millis(100),
            transmit_timeout: Duration::from_secs(5),
        }
    }
}
