//! Great-circle distance between coordinates

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Mean earth radius in kilometres (IUGG)
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

const KM_PER_MILE: f64 = 1.609344;
const KM_PER_NAUTICAL_MILE: f64 = 1.852;

/// Errors from parsing a `"lat,lon"` string
#[derive(Debug, Error, PartialEq)]
pub enum CoordinateError {
    #[error("expected \"lat,lon\", got {0} field(s)")]
    FieldCount(usize),

    #[error("invalid coordinate component: {0:?}")]
    NotANumber(String),

    #[error("coordinate out of range: {lat}, {lon}")]
    OutOfRange { lat: f64, lon: f64 },
}

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Haversine distance to `other` in kilometres
    pub fn haversine_km(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        // Rounding can push `a` a hair past 1 for antipodal points.
        let c = 2.0 * a.sqrt().min(1.0).asin();
        EARTH_RADIUS_KM * c
    }

    /// Distance to `other` in the requested unit
    pub fn distance_to(&self, other: &Coordinate, unit: DistanceUnit) -> f64 {
        unit.from_km(self.haversine_km(other))
    }
}

impl FromStr for Coordinate {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 2 {
            return Err(CoordinateError::FieldCount(parts.len()));
        }

        let parse = |part: &str| -> Result<f64, CoordinateError> {
            let part = part.trim();
            part.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| CoordinateError::NotANumber(part.to_string()))
        };

        let lat = parse(parts[0])?;
        let lon = parse(parts[1])?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::OutOfRange { lat, lon });
        }
        Ok(Coordinate::new(lat, lon))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// Unit for reported distances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistanceUnit {
    #[default]
    Miles,
    Kilometres,
    NauticalMiles,
}

impl DistanceUnit {
    /// Parse the `distance` query value. Anything unrecognised means miles.
    pub fn from_query(value: &str) -> Self {
        match value {
            "km" | "K" | "k" => DistanceUnit::Kilometres,
            "NM" | "nm" | "N" => DistanceUnit::NauticalMiles,
            _ => DistanceUnit::Miles,
        }
    }

    pub fn from_km(self, km: f64) -> f64 {
        match self {
            DistanceUnit::Miles => km / KM_PER_MILE,
            DistanceUnit::Kilometres => km,
            DistanceUnit::NauticalMiles => km / KM_PER_NAUTICAL_MILE,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            DistanceUnit::Miles => "mi",
            DistanceUnit::Kilometres => "km",
            DistanceUnit::NauticalMiles => "NM",
        }
    }

    /// Display form: rounded up to the next multiple of ten, e.g. `"350 km"`.
    pub fn label(self, distance: f64) -> String {
        let rounded = distance.round().max(0.0) as u64;
        let coarse = 10 * rounded.div_ceil(10);
        format!("{} {}", coarse, self.suffix())
    }
}
