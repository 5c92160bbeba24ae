use std::time::Duration;

use crate::channel::channel_config::ChannelConfig;
use crate::session::location::Coordinates;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// endpoint for application messages
    pub message_url: String,
    /// endpoint for location reports
    pub location_url: String,

    pub resend_threshold: Duration,
    pub resend_sweep_interval: Duration,

    /// a rendezvous handshake re-sends its sync request to the peer at this interval until
    ///  it completes
    pub sync_retry_interval: Duration,

    /// substituted for the real position if geolocation fails or takes longer than
    ///  `geolocation_timeout`
    pub fallback_location: Coordinates,
    pub geolocation_timeout: Duration,
}

impl SessionConfig {
    pub fn new(message_url: impl Into<String>, location_url: impl Into<String>) -> SessionConfig {
        SessionConfig {
            message_url: message_url.into(),
            location_url: location_url.into(),
            resend_threshold: Duration::from_millis(1000),
            resend_sweep_interval: Duration::from_millis(100),
            sync_retry_interval: Duration::from_millis(300),
            fallback_location: Coordinates::new(1.0, 1.0),
            geolocation_timeout: Duration::from_secs(10),
        }
    }

    pub fn message_channel_config(&self) -> ChannelConfig {
        self.channel_config("message", &self.message_url)
    }

    pub fn location_channel_config(&self) -> ChannelConfig {
        self.channel_config("location", &self.location_url)
    }

    fn channel_config(&self, name: &str, url: &str) -> ChannelConfig {
        let mut result = ChannelConfig::new(name, url);
        result.resend_threshold = self.resend_threshold;
        result.resend_sweep_interval = self.resend_sweep_interval;
        result
    }
}
