use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;

use crate::backend::Presigner;

fn parse_env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            let b = match s.as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" => false,
                _ => anyhow::bail!(
                    "invalid boolean env var {}={:?} (expected true/false/1/0)",
                    key,
                    v
                ),
            };
            Ok(Some(b))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)),
    }
}

/// Build an S3 client from the ambient environment.
///
/// - Default: standard AWS resolution (region/creds from env/config/role).
/// - `TUNER_S3_ENDPOINT_URL` points it at R2, MinIO or another S3-compatible store.
/// - `TUNER_S3_FORCE_PATH_STYLE` forces path-style addressing; it defaults to on
///   whenever a custom endpoint is set.
pub async fn client_from_env() -> Result<aws_sdk_s3::Client> {
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let endpoint_url: Option<String> = std::env::var("TUNER_S3_ENDPOINT_URL").ok();
    let force_path_style = match parse_env_bool("TUNER_S3_FORCE_PATH_STYLE")? {
        Some(v) => v,
        None => endpoint_url.is_some(),
    };

    let mut b: S3ConfigBuilder = aws_sdk_s3::config::Builder::from(&cfg);
    if let Some(url) = endpoint_url {
        b = b.endpoint_url(url);
    }
    if force_path_style {
        b = b.force_path_style(true);
    }

    Ok(aws_sdk_s3::Client::from_conf(b.build()))
}

/// Presigns single-object PUTs into one bucket.
pub struct S3Presigner {
    client: aws_sdk_s3::Client,
    bucket: String,
    expires_in: Duration,
}

impl S3Presigner {
    pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(15 * 60);

    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            expires_in: Self::DEFAULT_EXPIRY,
        }
    }

    pub fn with_expiry(mut self, expires_in: Duration) -> Self {
        self.expires_in = expires_in;
        self
    }
}

#[async_trait]
impl Presigner for S3Presigner {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn presign_put(&self, key: &str) -> Result<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(self.expires_in)?)
            .await?;
        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_booleans() {
        std::env::set_var("TUNER_TEST_BOOL_GARBAGE", "maybe");
        assert!(parse_env_bool("TUNER_TEST_BOOL_GARBAGE").is_err());
        std::env::set_var("TUNER_TEST_BOOL_YES", " Yes ");
        assert_eq!(parse_env_bool("TUNER_TEST_BOOL_YES").unwrap(), Some(true));
        assert_eq!(parse_env_bool("TUNER_TEST_BOOL_UNSET").unwrap(), None);
    }
}
