#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod dataset_key;
pub mod limits;
pub mod selection;
pub mod types;
