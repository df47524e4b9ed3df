pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod kv;
pub mod limits;
pub mod mail;
pub mod model;
pub mod observability;
pub mod password;
pub mod reaper;
pub mod sql;
pub mod throttle;
pub mod tls;
pub mod token;
pub mod wal;
pub mod wire;
