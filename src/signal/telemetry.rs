//! Telemetry samples
//!
//! Location updates from the publisher, validated on entry, cached on the
//! stream, and broadcast to every subscriber (including pending ones, so
//! dashboards can render a position before video starts).

use serde::{Deserialize, Serialize};

use crate::error::SignalError;
use crate::signal::message::SignalMessage;

/// A validated telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub source: Option<String>,
}

impl Telemetry {
    /// Validate a telemetry signal from a publisher
    ///
    /// Coordinates are required and range-checked; altitude and accuracy are
    /// dropped when non-finite (accuracy also when negative); a missing or
    /// non-positive timestamp is replaced with the current time.
    pub fn from_signal(msg: &SignalMessage) -> Result<Self, SignalError> {
        let (Some(latitude), Some(longitude)) = (msg.latitude, msg.longitude) else {
            return Err(SignalError::MissingCoordinates);
        };
        if !is_valid_latitude(latitude) || !is_valid_longitude(longitude) {
            return Err(SignalError::InvalidCoordinates);
        }

        let altitude = msg.altitude.filter(|a| a.is_finite());
        let accuracy = msg.accuracy.filter(|a| a.is_finite() && *a >= 0.0);
        let timestamp = match msg.timestamp {
            Some(ts) if ts > 0 => ts,
            _ => chrono::Utc::now().timestamp_millis(),
        };

        Ok(Self {
            latitude,
            longitude,
            altitude,
            accuracy,
            timestamp,
            source: msg.source.clone(),
        })
    }

    /// Render as a broadcastable signaling message
    pub fn to_signal(&self) -> SignalMessage {
        let mut msg = SignalMessage::telemetry();
        msg.latitude = Some(self.latitude);
        msg.longitude = Some(self.longitude);
        msg.altitude = self.altitude;
        msg.accuracy = self.accuracy;
        if self.timestamp > 0 {
            msg.timestamp = Some(self.timestamp);
        }
        msg.source = self.source.clone();
        msg
    }
}

fn is_valid_latitude(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

fn is_valid_longitude(lng: f64) -> bool {
    lng.is_finite() && (-180.0..=180.0).contains(&lng)
}
