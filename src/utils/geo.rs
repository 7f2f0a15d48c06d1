use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometres spanned by one degree of latitude.
pub const KM_PER_DEGREE: f64 = 111.32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> AppResult<Self> {
        let coords = Self { lat, lng };
        coords.validate()?;
        Ok(coords)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::InvalidInput(format!(
                "latitude {} is outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::InvalidInput(format!(
                "longitude {} is outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }

    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        haversine_distance(self.lat, self.lng, other.lat, other.lng)
    }
}

/// Calculate distance between two coordinates using Haversine formula
/// Returns distance in kilometers
pub fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    // Clamp guards against a > 1.0 from rounding on antipodal points
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * c
}

/// Check if a point is within `max_radius_km` of a center
pub fn is_within_radius(
    lat: f64,
    lng: f64,
    center_lat: f64,
    center_lng: f64,
    max_radius_km: f64,
) -> bool {
    haversine_distance(lat, lng, center_lat, center_lng) <= max_radius_km
}
