//! Stratus control-plane client.
//!
//! Resolves bucket names to ids and region ids to S3 endpoints via the
//! unified-config service. Lookups go through an [`ApiCache`] owned by
//! the client: regions barely ever change so they keep for a day,
//! bucket listings are only deduplicated across a burst of mounts.

pub mod cache;

pub use cache::ApiCache;

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const REGIONS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const BUCKETS_TTL: Duration = Duration::from_secs(1);
const BUCKET_BY_NAME_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code {status}")]
    Status { status: u16 },

    #[error("control plane rejected the request: {message}")]
    Rejected { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no region named {0}")]
    UnknownRegion(String),

    #[error("region {0} has no s3 service configured")]
    NoS3Service(String),

    #[error("invalid endpoint url {url}: {source}")]
    InvalidEndpoint {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Region {
    #[serde(rename = "id")]
    pub region_id: String,
    pub s3: Option<Service>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Service {
    #[serde(rename = "region_alias")]
    pub s3_region_id: String,
    pub domains: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Bucket {
    pub id: String,
    #[serde(rename = "tbl")]
    pub name: String,
    #[serde(rename = "region")]
    pub region_id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    uc_url: Url,
    access_key: String,
    secret_key: String,
    cache: ApiCache,
}

impl ApiClient {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        uc_url: Url,
        user_agent: &str,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            http,
            uc_url,
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            cache: ApiCache::new(),
        })
    }

    /// All region descriptors the config service knows about.
    pub async fn get_regions(&self) -> Result<Vec<Region>, ApiError> {
        let key = self.cache_key("regions");
        self.cache
            .get_or_fetch(&key, REGIONS_TTL, || async move {
                #[derive(Deserialize)]
                struct Response {
                    regions: Vec<Region>,
                }
                let response: Response = self.get_json("/regions").await?;
                Ok(response.regions)
            })
            .await
    }

    /// All buckets visible to the credentials, including read-shared
    /// ones.
    pub async fn get_buckets(&self) -> Result<Vec<Bucket>, ApiError> {
        let key = self.cache_key("buckets");
        self.cache
            .get_or_fetch(&key, BUCKETS_TTL, || async move {
                self.get_json("/v2/buckets?shared=rd").await
            })
            .await
    }

    pub async fn find_bucket_by_name(&self, name: &str) -> Result<Option<Bucket>, ApiError> {
        let key = self.cache_key(&format!("bucket-{name}"));
        self.cache
            .get_or_fetch(&key, BUCKET_BY_NAME_TTL, || async move {
                let buckets = self.get_buckets().await?;
                Ok(buckets.into_iter().find(|b| b.name == name))
            })
            .await
    }

    /// The S3 endpoint URL of a region. Bare domains inherit the
    /// config service's scheme.
    pub async fn get_s3_endpoint(&self, region_id: &str) -> Result<Url, ApiError> {
        let region = self.region(region_id).await?;
        let service = region.s3.ok_or_else(|| ApiError::NoS3Service(region_id.to_string()))?;
        let domain = service
            .domains
            .first()
            .ok_or_else(|| ApiError::NoS3Service(region_id.to_string()))?;
        endpoint_url(domain, self.uc_url.scheme())
    }

    /// The S3 alias of a region id, e.g. `z0` to `cn-east-1`.
    pub async fn s3_region_id(&self, region_id: &str) -> Result<String, ApiError> {
        let region = self.region(region_id).await?;
        let service = region.s3.ok_or_else(|| ApiError::NoS3Service(region_id.to_string()))?;
        Ok(service.s3_region_id)
    }

    async fn region(&self, region_id: &str) -> Result<Region, ApiError> {
        self.get_regions()
            .await?
            .into_iter()
            .find(|r| r.region_id == region_id)
            .ok_or_else(|| ApiError::UnknownRegion(region_id.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.uc_url.as_str().trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response.json().await?);
        }
        let body = response.bytes().await.unwrap_or_default();
        if let Ok(err) = serde_json::from_slice::<ErrorBody>(&body) {
            return Err(ApiError::Rejected { message: err.error });
        }
        Err(ApiError::Status {
            status: status.as_u16(),
        })
    }

    /// Cache keys carry the credentials and endpoint so clients for
    /// different accounts never share entries.
    fn cache_key(&self, suffix: &str) -> String {
        format!("{}-{}-{}-{suffix}", self.access_key, self.secret_key, self.uc_url)
    }
}

fn endpoint_url(domain: &str, default_scheme: &str) -> Result<Url, ApiError> {
    let raw = if domain.contains("://") {
        domain.to_string()
    } else {
        format!("{default_scheme}://{domain}")
    };
    Url::parse(&raw).map_err(|source| ApiError::InvalidEndpoint { url: raw, source })
}
