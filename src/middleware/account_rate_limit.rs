//! Per-account limits for authenticated routes, keyed by the JWT subject
//! rather than the peer address.

use std::sync::Arc;
use std::time::Duration;

use axum::http::Request;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::KeyExtractor, GovernorError, GovernorLayer,
};
use uuid::Uuid;

use crate::middleware::rate_limit::rate_limit_error_handler;
use crate::utils::jwt::Claims;

/// Keys the limiter on the account in the verified claims. Must sit inside
/// `auth_middleware`.
#[derive(Debug, Clone, Copy)]
pub struct AccountKey;

impl KeyExtractor for AccountKey {
    type Key = Uuid;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        req.extensions()
            .get::<Claims>()
            .map(|claims| claims.sub)
            .ok_or(GovernorError::UnableToExtractKey)
    }
}

pub type AccountGovernorLayer = GovernorLayer<
    AccountKey,
    governor::middleware::NoOpMiddleware<governor::clock::QuantaInstant>,
    axum::body::Body,
>;

/// Which family of routes a limiter guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteBudget {
    /// Ride creation. A rider books a handful of trips a day; 100 a minute
    /// with a refill every 600ms already covers retry storms from a flaky
    /// client.
    Booking,
    /// Ride reads, cancels, fare estimates, the nearby-drivers map, history
    /// and earnings. Both apps poll these for the whole trip, so the bucket
    /// is five times wider and refills every 120ms.
    Tracking,
}

impl RouteBudget {
    /// Token refill interval and bucket size.
    pub fn limits(self) -> (Duration, u32) {
        match self {
            RouteBudget::Booking => (Duration::from_millis(600), 100),
            RouteBudget::Tracking => (Duration::from_millis(120), 500),
        }
    }
}

pub fn create_account_governor(budget: RouteBudget) -> AccountGovernorLayer {
    let (refill, burst) = budget.limits();
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .period(refill)
            .burst_size(burst)
            .key_extractor(AccountKey)
            .finish()
            .expect("account governor config is valid"),
    );

    GovernorLayer::new(config).error_handler(rate_limit_error_handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::user::UserRole;
    use axum::body::Body;

    #[test]
    fn test_tracking_allows_five_times_booking() {
        let per_minute = |budget: RouteBudget| {
            let (refill, _) = budget.limits();
            60_000 / refill.as_millis()
        };
        assert_eq!(per_minute(RouteBudget::Booking), 100);
        assert_eq!(per_minute(RouteBudget::Tracking), 500);
        assert_eq!(RouteBudget::Tracking.limits().1, 5 * RouteBudget::Booking.limits().1);
    }

    #[test]
    fn test_key_is_claims_subject() {
        let mut req = Request::new(Body::empty());
        assert!(matches!(
            AccountKey.extract(&req),
            Err(GovernorError::UnableToExtractKey)
        ));

        let sub = Uuid::new_v4();
        req.extensions_mut().insert(Claims {
            sub,
            email: "ada@example.com".to_string(),
            role: UserRole::Rider,
            exp: 0,
            iat: 0,
        });
        assert_eq!(AccountKey.extract(&req).unwrap(), sub);
    }
}
