use std::net::SocketAddr;

/// default for [RelayConfig::nearby_range], in degrees
pub const DEFAULT_NEARBY_RANGE: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// request path of the message endpoint
    pub message_path: String,
    /// request path of the location endpoint
    pub location_path: String,
    /// A `nearby` request reports the participants whose last position lies within this many
    ///  degrees (latitude and longitude) of the requester's.
    pub nearby_range: f64,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            bind_addr,
            message_path: "/message".to_string(),
            location_path: "/location".to_string(),
            nearby_range: DEFAULT_NEARBY_RANGE,
        }
    }

    pub fn message_url(&self, addr: SocketAddr) -> String {
        format!("ws://{}{}", addr, self.message_path)
    }

    pub fn location_url(&self, addr: SocketAddr) -> String {
        format!("ws://{}{}", addr, self.location_path)
    }
}
