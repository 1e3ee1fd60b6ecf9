//! Storage locations: local directories and S3 prefixes behind `object_store`.

use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How to authenticate against S3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3Access {
    /// Unsigned requests to a public bucket in `region`
    Anonymous { region: String },

    /// Credentials and region from the environment, AWS config files or the
    /// instance profile
    FromEnv,
}

impl S3Access {
    pub fn new(anonymous: bool, region: &str) -> Self {
        if anonymous {
            S3Access::Anonymous {
                region: region.to_string(),
            }
        } else {
            S3Access::FromEnv
        }
    }
}

/// A local directory or an S3 bucket with a key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
}

impl Location {
    /// Parse `s3://bucket[/prefix]` or a local path.
    pub fn parse(location: &str) -> Result<Self> {
        match location.strip_prefix("s3://") {
            Some(rest) => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    anyhow::bail!("Invalid S3 URI '{}': missing bucket", location);
                }
                Ok(Location::S3 {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                })
            }
            None => Ok(Location::Local(PathBuf::from(location))),
        }
    }

    /// Key prefix inside the opened store; local stores are rooted at the directory.
    pub fn prefix(&self) -> &str {
        match self {
            Location::Local(_) => "",
            Location::S3 { prefix, .. } => prefix,
        }
    }

    /// Open a store for this location.
    pub fn open(&self, access: &S3Access) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Location::Local(path) => create_local_store(path),
            Location::S3 { bucket, .. } => create_s3_store(bucket, access),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::S3 { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
        }
    }
}

fn client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(120))
        .with_pool_idle_timeout(Duration::from_secs(60))
}

/// Exponential backoff on throttling and server errors.
fn retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(15),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(180),
    }
}

/// S3 client for one bucket.
pub fn create_s3_store(bucket: &str, access: &S3Access) -> Result<Arc<dyn ObjectStore>> {
    let builder = match access {
        S3Access::Anonymous { region } => {
            tracing::info!("Creating anonymous S3 client for bucket: {} ({})", bucket, region);
            AmazonS3Builder::new().with_region(region).with_skip_signature(true)
        }
        S3Access::FromEnv => {
            tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);
            AmazonS3Builder::from_env()
        }
    };

    let store = builder
        .with_bucket_name(bucket)
        .with_client_options(client_options())
        .with_retry(retry_config())
        .build()
        .with_context(|| format!("Failed to configure S3 client for {}", bucket))?;
    Ok(Arc::new(store))
}

/// Local filesystem store rooted at `path`, creating the directory.
pub fn create_local_store(path: impl Into<PathBuf>) -> Result<Arc<dyn ObjectStore>> {
    let path = path.into();
    std::fs::create_dir_all(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    tracing::debug!("Opening local store at {}", path.display());
    Ok(Arc::new(LocalFileSystem::new_with_prefix(&path)?))
}
