//! Cross-cutting utilities: logging, HTTP client construction, metrics,
//! address derivation, price conversion, and healthcheck pings.

pub mod address;
pub mod healthcheck;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod price;

pub use http::{build_client, HttpClientConfig};
pub use price::PriceClient;
