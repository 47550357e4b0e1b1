//! cometwatch is a monitoring and alerting daemon for Tendermint/CometBFT
//! validators.
//!
//! For each configured chain it keeps a live block-by-block signing tape fed
//! by a websocket subscription, refreshes validator and slashing state on a
//! timer, evaluates alert rules every two seconds, and fans confirmed alerts
//! out to PagerDuty, Telegram, Discord, and Slack. A websocket dashboard and
//! a Prometheus exporter observe everything without driving it.

pub mod bootstrap;
pub mod models;
pub mod repositories;
pub mod services;
pub mod utils;
