pub mod gamma;
pub mod get_rates;
pub mod rate_heterogeneity;
