use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::time;
use tracing::{debug, warn};

use crate::session::location::Coordinates;


#[derive(Debug, thiserror::Error)]
pub enum GeolocationError {
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("geolocation is not supported")]
    Unsupported,
}

/// Source of the local participant's position. Acquiring a fix may take a long time (or fail),
///  and a session never waits for it before it is usable.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GeolocationProvider: Send + Sync + 'static {
    async fn current_position(&self) -> Result<Coordinates, GeolocationError>;
}

/// always reports the same position
pub struct FixedGeolocation(pub Coordinates);

#[async_trait]
impl GeolocationProvider for FixedGeolocation {
    async fn current_position(&self) -> Result<Coordinates, GeolocationError> {
        Ok(self.0)
    }
}

/// for environments without any positioning
pub struct NoGeolocation {}

#[async_trait]
impl GeolocationProvider for NoGeolocation {
    async fn current_position(&self) -> Result<Coordinates, GeolocationError> {
        Err(GeolocationError::Unsupported)
    }
}

/// Returns the provider's position, or `fallback` if the provider fails or does not answer
///  within `timeout`. This never fails.
pub async fn current_position_or_fallback(provider: &dyn GeolocationProvider, timeout: Duration, fallback: Coordinates) -> Coordinates {
    match time::timeout(timeout, provider.current_position()).await {
        Ok(Ok(position)) => {
            debug!("geolocation: {:?}", position);
            position
        }
        Ok(Err(e)) => {
            warn!("geolocation failed, using fallback {:?}: {}", fallback, e);
            fallback
        }
        Err(_) => {
            warn!("geolocation timed out after {:?}, using fallback {:?}", timeout, fallback);
            fallback
        }
    }
}
