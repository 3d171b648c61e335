//! Registry Core Library
//!
//! Central, server-authoritative membership and event-ordering registry for
//! pools of cooperating processes. Every pool has a totally ordered event log
//! (joins, leaves, deaths, elections, signals) that the server pushes to all
//! live members, while a failure detector probes members that went quiet.

pub mod client;
pub mod config;
pub mod connection;
pub mod detector;
pub mod disseminator;
pub mod election;
pub mod error;
pub mod event_log;
pub mod handler;
pub mod member;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod statistics;
pub mod types;

pub use client::{MemberEndpoint, RegistryClient};
pub use config::RegistryConfig;
pub use error::{RegistryError, Result};
pub use pool::Pool;
pub use server::{PoolRegistry, Server};
pub use statistics::CommunicationStatistics;
pub use types::*;
