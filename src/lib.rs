//! pricegate: metered, token-gated access to streamed historical prices.
//!
//! Library crate shared by the `pricegate` binary and the integration tests
//! in `tests/`.

pub mod access;
pub mod cli;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod jobs;
pub mod ledger;
pub mod metrics;
pub mod prices;
