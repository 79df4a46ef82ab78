use anyhow::{bail, Context, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, ConfigError, LogsConfig, RowLimits, SongsConfig};
use crate::storage::{LocalStore, Location, ObjectStore, S3Store};

/// Everything a stage needs: where to read, where to write, and what to do.
/// Built once per run and passed by reference into each stage.
pub struct Session {
    pub input: Arc<dyn ObjectStore>,
    pub output: Arc<dyn ObjectStore>,
    pub songs: SongsConfig,
    pub logs: LogsConfig,
    pub limits: RowLimits,
}

impl Session {
    pub fn new(input: Arc<dyn ObjectStore>, output: Arc<dyn ObjectStore>, config: &Config) -> Self {
        Self {
            input,
            output,
            songs: config.songs.clone(),
            logs: config.logs.clone(),
            limits: config.limits,
        }
    }

    /// Opens both storage locations and checks they are usable.
    pub async fn bootstrap(config: &Config) -> Result<Self> {
        let input_location = config.input_location()?;
        let output_location = config.output_location()?;

        let client = if input_location.is_s3() || output_location.is_s3() {
            Some(s3_client(config).await?)
        } else {
            None
        };

        let input = open_store(&input_location, client.as_ref(), true)
            .await
            .with_context(|| format!("Input location {} is not usable", input_location))?;
        let output = open_store(&output_location, client.as_ref(), false)
            .await
            .with_context(|| format!("Output location {} is not usable", output_location))?;

        info!("Reading from {}, writing to {}", input_location, output_location);
        Ok(Self::new(input, output, config))
    }
}

async fn s3_client(config: &Config) -> Result<Client> {
    let iam = config.iam.as_ref().ok_or(ConfigError::MissingKey("iam"))?;
    let credentials = Credentials::new(
        iam.aws_access_key_id.clone(),
        iam.aws_secret_access_key.clone(),
        iam.aws_session_token.clone(),
        None,
        "sparkify-lake-config",
    );

    let region_provider = RegionProviderChain::first_try(config.storage.region.clone().map(Region::new))
        .or_default_provider()
        .or_else("us-west-2");

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .credentials_provider(credentials);
    if let Some(endpoint) = &config.storage.endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    let shared_config = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
        .force_path_style(config.storage.force_path_style)
        .build();
    Ok(Client::from_conf(s3_config))
}

async fn open_store(
    location: &Location,
    client: Option<&Client>,
    must_exist: bool,
) -> Result<Arc<dyn ObjectStore>> {
    match location {
        Location::S3 { bucket, prefix } => {
            let Some(client) = client else {
                bail!("No S3 client configured for {}", location);
            };
            let store = S3Store::new(client.clone(), bucket.clone(), prefix.clone());
            store.probe().await?;
            Ok(Arc::new(store))
        }
        Location::Local(path) => {
            if must_exist {
                if !path.is_dir() {
                    bail!("Directory {} does not exist", path.display());
                }
            } else {
                tokio::fs::create_dir_all(path)
                    .await
                    .with_context(|| format!("Error creating {}", path.display()))?;
            }
            Ok(Arc::new(LocalStore::new(path.clone())))
        }
    }
}
