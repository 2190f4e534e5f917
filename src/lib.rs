//! Library crate for mtproxy-checker exposing reusable modules.
pub mod aggregator;
mod faketls;
pub mod mtproto;
pub mod parser;
pub mod probe;
pub mod scheduler;
pub mod secret;
pub mod server;
pub mod types;
