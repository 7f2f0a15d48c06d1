pub mod auth;
pub mod rate_limit;
pub mod account_rate_limit;
