#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod bounded;
pub mod normalize;
#[cfg(feature = "s3")]
pub mod s3;
pub mod session;
pub mod transport;
pub mod uploader;
