#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod facade;
pub mod orchestrator;
pub mod sync_worker;
