//! Fare computation.
//!
//! `FareEngine::quote` is a pure function of its inputs and the tariff in
//! [`FareConfig`]: no I/O, no clock, no shared state.

use serde::Serialize;

use crate::config::FareConfig;
use crate::entities::driver::VehicleClass;
use crate::error::{AppError, AppResult};
use crate::utils::geo::Coordinates;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FareQuote {
    pub base: f64,
    pub distance_fare: f64,
    pub time_fare: f64,
    pub surge_multiplier: f64,
    pub total: f64,
    pub platform_commission: f64,
    pub driver_earnings: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FareEstimate {
    pub distance_km: f64,
    pub duration_min: f64,
    pub quote: FareQuote,
}

#[derive(Debug, Clone)]
pub struct FareEngine {
    config: FareConfig,
}

/// Round to cents, halves away from zero. The small nudge absorbs binary
/// representation error (2.675 is stored as 2.67499999...).
pub fn round_half_up(value: f64) -> f64 {
    (value * 100.0 + 0.5 + 1e-9).floor() / 100.0
}

impl FareEngine {
    pub fn new(config: FareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FareConfig {
        &self.config
    }

    pub fn quote(
        &self,
        distance_km: f64,
        duration_min: f64,
        vehicle_class: VehicleClass,
        surge_multiplier: f64,
    ) -> AppResult<FareQuote> {
        if !distance_km.is_finite() || distance_km < 0.0 {
            return Err(AppError::InvalidInput(format!(
                "distance must be a non-negative number, got {}",
                distance_km
            )));
        }
        if !duration_min.is_finite() || duration_min < 0.0 {
            return Err(AppError::InvalidInput(format!(
                "duration must be a non-negative number, got {}",
                duration_min
            )));
        }
        self.validate_surge(surge_multiplier)?;

        let class_multiplier = self.config.class_multiplier(vehicle_class);
        let distance_fare = distance_km * self.config.per_km_rate * class_multiplier;
        let time_fare = duration_min * self.config.per_min_rate * class_multiplier;
        let subtotal = self.config.base_fare + distance_fare + time_fare;

        let total = round_half_up(surge_multiplier * subtotal);
        let platform_commission = round_half_up(total * self.config.commission_rate);

        Ok(FareQuote {
            base: round_half_up(self.config.base_fare),
            distance_fare: round_half_up(distance_fare),
            time_fare: round_half_up(time_fare),
            surge_multiplier,
            total,
            platform_commission,
            driver_earnings: round_half_up(total - platform_commission),
        })
    }

    pub fn validate_surge(&self, surge_multiplier: f64) -> AppResult<()> {
        if !surge_multiplier.is_finite() || surge_multiplier < 1.0 {
            return Err(AppError::InvalidInput(format!(
                "surge multiplier must be at least 1.0, got {}",
                surge_multiplier
            )));
        }
        if surge_multiplier > self.config.max_surge_multiplier {
            return Err(AppError::InvalidInput(format!(
                "surge multiplier {} exceeds the maximum of {}",
                surge_multiplier, self.config.max_surge_multiplier
            )));
        }
        Ok(())
    }

    /// Pre-trip estimate from the straight-line distance and the configured
    /// average speed; duration is rounded up to whole minutes.
    pub fn estimate(
        &self,
        pickup: &Coordinates,
        dropoff: &Coordinates,
        vehicle_class: VehicleClass,
        surge_multiplier: f64,
    ) -> AppResult<FareEstimate> {
        pickup.validate()?;
        dropoff.validate()?;

        let distance_km = pickup.distance_km(dropoff);
        let duration_min = (distance_km / self.config.average_speed_kmh * 60.0).ceil();
        let quote = self.quote(distance_km, duration_min, vehicle_class, surge_multiplier)?;

        Ok(FareEstimate {
            distance_km,
            duration_min,
            quote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FareEngine {
        FareEngine::new(FareConfig::default())
    }

    #[test]
    fn test_economy_reference_quote() {
        let quote = engine().quote(10.0, 20.0, VehicleClass::Economy, 1.0).unwrap();
        assert_eq!(quote.base, 2.50);
        assert_eq!(quote.distance_fare, 12.00);
        assert_eq!(quote.time_fare, 6.00);
        assert_eq!(quote.total, 20.50);
        assert_eq!(quote.platform_commission, 3.08);
        assert_eq!(quote.driver_earnings, 17.42);
    }

    #[test]
    fn test_surge_scales_whole_fare() {
        let quote = engine().quote(10.0, 20.0, VehicleClass::Economy, 1.5).unwrap();
        assert_eq!(quote.total, 30.75);
    }

    #[test]
    fn test_class_multiplier_applies_to_rates_not_base() {
        let config = FareConfig {
            comfort_multiplier: 2.0,
            ..FareConfig::default()
        };
        let quote = FareEngine::new(config)
            .quote(10.0, 20.0, VehicleClass::Comfort, 1.0)
            .unwrap();
        assert_eq!(quote.base, 2.50);
        assert_eq!(quote.total, 2.50 + 24.00 + 12.00);
    }

    #[test]
    fn test_rates_are_overridable() {
        let config = FareConfig {
            base_fare: 5.0,
            per_km_rate: 2.0,
            per_min_rate: 0.5,
            ..FareConfig::default()
        };
        let quote = FareEngine::new(config)
            .quote(3.0, 10.0, VehicleClass::Economy, 1.0)
            .unwrap();
        assert_eq!(quote.total, 16.0);
    }

    #[test]
    fn test_rounds_half_up() {
        assert_eq!(round_half_up(2.675), 2.68);
        assert_eq!(round_half_up(1.005), 1.01);
        assert_eq!(round_half_up(1.004), 1.0);
        assert_eq!(round_half_up(0.0), 0.0);
    }

    #[test]
    fn test_rejects_negative_inputs() {
        let engine = engine();
        assert!(matches!(
            engine.quote(-1.0, 5.0, VehicleClass::Economy, 1.0),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.quote(1.0, -5.0, VehicleClass::Economy, 1.0),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.quote(f64::NAN, 5.0, VehicleClass::Economy, 1.0),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_surge_out_of_bounds() {
        let engine = engine();
        assert!(engine.quote(1.0, 1.0, VehicleClass::Economy, 0.9).is_err());
        assert!(engine.quote(1.0, 1.0, VehicleClass::Economy, 3.5).is_err());
        assert!(engine.quote(1.0, 1.0, VehicleClass::Economy, 3.0).is_ok());
    }

    #[test]
    fn test_quote_is_monotonic_in_distance_and_duration() {
        let engine = engine();
        for class in [
            VehicleClass::Economy,
            VehicleClass::Comfort,
            VehicleClass::Xl,
            VehicleClass::Bike,
        ] {
            let mut previous = 0.0;
            for step in 0..200 {
                let distance = step as f64 * 0.37;
                let total = engine.quote(distance, 12.0, class, 1.2).unwrap().total;
                assert!(total >= previous, "{class}: {total} < {previous} at {distance} km");
                previous = total;
            }

            let mut previous = 0.0;
            for step in 0..200 {
                let duration = step as f64 * 0.53;
                let total = engine.quote(4.0, duration, class, 1.2).unwrap().total;
                assert!(total >= previous, "{class}: {total} < {previous} at {duration} min");
                previous = total;
            }
        }
    }

    #[test]
    fn test_estimate_rounds_duration_up() {
        let pickup = Coordinates { lat: 6.5244, lng: 3.3792 };
        let dropoff = Coordinates { lat: 6.6018, lng: 3.3515 };
        let estimate = engine()
            .estimate(&pickup, &dropoff, VehicleClass::Economy, 1.0)
            .unwrap();
        assert!(estimate.distance_km > 8.0 && estimate.distance_km < 10.0);
        assert_eq!(estimate.duration_min, estimate.duration_min.ceil());
        assert!(estimate.quote.total > 2.50);
    }
}
