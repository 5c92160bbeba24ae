use serde::{Deserialize, Serialize};

/// A geographic position as reported by a geolocation provider and sent in location reports.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Coordinates {
        Coordinates { latitude, longitude }
    }
}
