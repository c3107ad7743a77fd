//! Connection to the bucket that holds document files.

use anyhow::{bail, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client as S3Client,
};
use tracing::info;

use crate::{config::AppConfig, storage::S3Storage};

const FALLBACK_REGION: &str = "us-east-1";

/// Object store settings, checked before any client is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub static_credentials: Option<(String, String)>,
}

impl ObjectStoreSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let bucket = config.s3_bucket.trim();
        if bucket.is_empty() {
            bail!("S3_BUCKET must not be empty");
        }

        let static_credentials = match (
            non_blank(config.aws_access_key_id.as_deref()),
            non_blank(config.aws_secret_access_key.as_deref()),
        ) {
            (Some(key), Some(secret)) => Some((key.to_string(), secret.to_string())),
            (None, None) => None,
            _ => bail!("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together"),
        };

        let region = non_blank(Some(config.aws_region.as_str())).unwrap_or(FALLBACK_REGION);

        Ok(Self {
            bucket: bucket.to_string(),
            region: region.to_string(),
            endpoint_url: non_blank(config.aws_endpoint_url.as_deref()).map(str::to_string),
            static_credentials,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

pub async fn build_client(settings: &ObjectStoreSettings) -> S3Client {
    let region_provider = RegionProviderChain::first_try(Some(Region::new(settings.region.clone())))
        .or_default_provider()
        .or_else(FALLBACK_REGION);

    #[allow(deprecated)]
    let mut loader = aws_config::from_env().region(region_provider);
    if let Some(endpoint) = &settings.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    if let Some((key, secret)) = &settings.static_credentials {
        loader = loader.credentials_provider(Credentials::new(
            key.clone(),
            secret.clone(),
            None,
            None,
            "edms-static",
        ));
    }

    let base_config = loader.load().await;
    // S3-compatible stores such as MinIO need path-style addressing.
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(true)
        .build();
    S3Client::from_conf(s3_config)
}

/// Builds the document store used by every binary.
pub async fn connect_storage(config: &AppConfig) -> Result<S3Storage> {
    let settings = ObjectStoreSettings::from_config(config)?;
    info!(
        bucket = %settings.bucket,
        region = %settings.region,
        endpoint = settings.endpoint_url.as_deref().unwrap_or("aws"),
        static_credentials = settings.static_credentials.is_some(),
        "connecting document storage"
    );
    let client = build_client(&settings).await;
    Ok(S3Storage::new(client, settings.bucket))
}
