pub mod admin;
pub mod app;
pub mod bridge;
pub mod config;
pub mod dialer;
pub mod logging;
pub mod net;
pub mod parser;
pub mod pingcache;
pub mod proxy;
pub mod reload;
pub mod router;
pub mod telemetry;
pub mod tunnel;
pub mod wire;
