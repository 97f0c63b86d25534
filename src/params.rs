//! Volume parameter parsing.
//!
//! Storage class and volume attributes arrive as two loosely typed
//! string maps (attributes and secrets). Keys are matched
//! case-insensitively; attributes win over secrets. Whatever the maps
//! leave unresolved (bucket id, S3 endpoint, S3 region) is filled in
//! from the control plane by [`ObjectStoreParams::resolve`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::api::ApiClient;
use crate::protocol::{InitFilesystemMount, InitObjectStoreMount};

const FIELD_ACCESS_KEY: &str = "accesskey";
const FIELD_SECRET_KEY: &str = "secretkey";
const FIELD_UC_ENDPOINT: &str = "ucendpoint";
const FIELD_REGION: &str = "region";
const FIELD_STORAGE_CLASS: &str = "storageclass";
const FIELD_SUB_DIR: &str = "subdir";
const FIELD_S3_FORCE_PATH_STYLE: &str = "s3forcepathstyle";
const FIELD_BUCKET_ID: &str = "bucketid";
const FIELD_BUCKET_NAME: &str = "bucketname";
const FIELD_S3_REGION: &str = "s3region";
const FIELD_S3_ENDPOINT: &str = "s3endpoint";
const FIELD_GATEWAY_ID: &str = "gatewayid";
const FIELD_ACCESS_TOKEN: &str = "accesstoken";
const FIELD_MASTER_SERVER_ADDRESS: &str = "mastersvraddr";

const DEFAULT_REGION: &str = "z0";
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("{0} is empty")]
    Missing(&'static str),

    #[error("unrecognized {field}: {value}")]
    InvalidBool { field: &'static str, value: String },

    #[error("failed to parse {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("invalid {field}: {value}: {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid {field} duration: {value}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("unrecognized vfscachemode: {0}")]
    InvalidCacheMode(String),

    #[error("cannot find bucket by name {0}")]
    BucketNotFound(String),

    #[error("bucket is not identified, set bucketid or bucketname")]
    BucketUnspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfsCacheMode {
    #[default]
    Off,
    Minimal,
    Writes,
    Full,
}

impl VfsCacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VfsCacheMode::Off => "off",
            VfsCacheMode::Minimal => "minimal",
            VfsCacheMode::Writes => "writes",
            VfsCacheMode::Full => "full",
        }
    }
}

impl fmt::Display for VfsCacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VfsCacheMode {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "off" => Ok(VfsCacheMode::Off),
            "min" | "minimal" => Ok(VfsCacheMode::Minimal),
            "writes" => Ok(VfsCacheMode::Writes),
            "full" => Ok(VfsCacheMode::Full),
            other => Err(ParamError::InvalidCacheMode(other.to_string())),
        }
    }
}

/// Everything needed to build an object store mount command, parsed
/// from volume attributes and secrets.
#[derive(Debug, Clone)]
pub struct ObjectStoreParams {
    pub access_key: String,
    pub secret_key: String,
    pub uc_endpoint: Url,
    pub region: String,
    pub storage_class: String,
    pub sub_dir: String,
    pub s3_force_path_style: bool,

    pub bucket_id: String,
    pub bucket_name: String,
    pub s3_endpoint: Option<Url>,
    pub s3_region: Option<String>,

    pub vfs_cache_mode: Option<VfsCacheMode>,
    pub dir_cache_duration: Option<String>,
    pub buffer_size: Option<u64>,
    pub vfs_cache_max_age: Option<String>,
    pub vfs_cache_poll_interval: Option<String>,
    pub vfs_write_back: Option<String>,
    pub vfs_cache_max_size: Option<u64>,
    pub vfs_read_ahead: Option<u64>,
    pub vfs_fast_finger_print: bool,
    pub vfs_read_chunk_size: Option<u64>,
    pub vfs_read_chunk_size_limit: Option<u64>,
    pub no_check_sum: bool,
    pub no_mod_time: bool,
    pub no_seek: bool,
    pub read_only: bool,
    pub vfs_read_wait: Option<String>,
    pub vfs_write_wait: Option<String>,
    pub transfers: Option<u64>,
    pub vfs_disk_space_total_size: Option<u64>,
    pub upload_cutoff: Option<u64>,
    pub upload_chunk_size: Option<u64>,
    pub upload_concurrency: Option<u64>,
    pub write_back_cache: bool,
    pub debug_http: bool,
    pub debug_fuse: bool,
}

impl ObjectStoreParams {
    pub fn parse(
        attributes: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<Self, ParamError> {
        let fields = Fields::new(attributes, secrets);

        let params = Self {
            access_key: fields.required(FIELD_ACCESS_KEY)?,
            secret_key: fields.required(FIELD_SECRET_KEY)?,
            uc_endpoint: fields
                .url(FIELD_UC_ENDPOINT)?
                .ok_or(ParamError::Missing(FIELD_UC_ENDPOINT))?,
            region: fields
                .optional(FIELD_REGION)
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            storage_class: fields
                .optional(FIELD_STORAGE_CLASS)
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            sub_dir: fields.optional(FIELD_SUB_DIR).unwrap_or_default(),
            s3_force_path_style: fields.bool(FIELD_S3_FORCE_PATH_STYLE)?.unwrap_or(true),

            bucket_id: fields.optional(FIELD_BUCKET_ID).unwrap_or_default(),
            bucket_name: fields.optional(FIELD_BUCKET_NAME).unwrap_or_default(),
            s3_endpoint: fields.url(FIELD_S3_ENDPOINT)?,
            s3_region: fields.optional(FIELD_S3_REGION),

            vfs_cache_mode: fields
                .optional("vfscachemode")
                .map(|v| v.parse())
                .transpose()?,
            dir_cache_duration: fields.duration("dircacheduration")?,
            buffer_size: fields.uint("buffersize")?,
            vfs_cache_max_age: fields.duration("vfscachemaxage")?,
            vfs_cache_poll_interval: fields.duration("vfscachepollinterval")?,
            vfs_write_back: fields.duration("vfswriteback")?,
            vfs_cache_max_size: fields.uint("vfscachemaxsize")?,
            vfs_read_ahead: fields.uint("vfsreadahead")?,
            vfs_fast_finger_print: fields.bool("vfsfastfingerprint")?.unwrap_or(false),
            vfs_read_chunk_size: fields.uint("vfsreadchunksize")?,
            vfs_read_chunk_size_limit: fields.uint("vfsreadchunksizelimit")?,
            no_check_sum: fields.bool("nochecksum")?.unwrap_or(false),
            no_mod_time: fields.bool("nomodtime")?.unwrap_or(false),
            no_seek: fields.bool("noseek")?.unwrap_or(false),
            read_only: fields.bool("readonly")?.unwrap_or(false),
            vfs_read_wait: fields.duration("vfsreadwait")?,
            vfs_write_wait: fields.duration("vfswritewait")?,
            transfers: fields.uint("transfers")?,
            vfs_disk_space_total_size: fields.uint("vfsdiskspacetotalsize")?,
            upload_cutoff: fields.uint("uploadcutoff")?,
            upload_chunk_size: fields.uint("uploadchunksize")?,
            upload_concurrency: fields.uint("uploadconcurrency")?,
            write_back_cache: fields.bool("writebackcache")?.unwrap_or(false),
            debug_http: fields.bool("debughttp")?.unwrap_or(false),
            debug_fuse: fields.bool("debugfuse")?.unwrap_or(false),
        };

        if params.bucket_id.is_empty() && params.bucket_name.is_empty() {
            return Err(ParamError::BucketUnspecified);
        }
        Ok(params)
    }

    /// Fill in the bucket id, S3 endpoint and S3 region from the
    /// control plane where the maps left them unset.
    pub async fn resolve(mut self, api: &ApiClient) -> crate::Result<Self> {
        if self.bucket_id.is_empty() {
            let bucket = api
                .find_bucket_by_name(&self.bucket_name)
                .await
                .map_err(crate::ConnectorError::Api)?
                .ok_or_else(|| ParamError::BucketNotFound(self.bucket_name.clone()))?;
            self.bucket_id = bucket.id;
            self.region = bucket.region_id;
        }
        if self.s3_endpoint.is_none() {
            self.s3_endpoint = Some(api.get_s3_endpoint(&self.region).await?);
        }
        if self.s3_region.is_none() {
            self.s3_region = Some(api.s3_region_id(&self.region).await?);
        }
        Ok(self)
    }

    /// Build the wire command for a resolved parameter set.
    pub fn init_command(
        &self,
        volume_id: &str,
        mount_path: &str,
    ) -> Result<InitObjectStoreMount, ParamError> {
        let s3_endpoint = self
            .s3_endpoint
            .as_ref()
            .ok_or(ParamError::Missing(FIELD_S3_ENDPOINT))?;
        let s3_region = self
            .s3_region
            .as_deref()
            .ok_or(ParamError::Missing(FIELD_S3_REGION))?;
        if self.bucket_id.is_empty() {
            return Err(ParamError::Missing(FIELD_BUCKET_ID));
        }

        Ok(InitObjectStoreMount {
            volume_id: volume_id.to_string(),
            mount_path: mount_path.to_string(),
            sub_dir: self.sub_dir.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            bucket_id: self.bucket_id.clone(),
            s3_region: s3_region.to_string(),
            s3_endpoint: s3_endpoint.to_string(),
            s3_force_path_style: self.s3_force_path_style,
            storage_class: self.storage_class.clone(),
            vfs_cache_mode: self.vfs_cache_mode.map(|m| m.as_str().to_string()),
            dir_cache_duration: self.dir_cache_duration.clone(),
            buffer_size: self.buffer_size,
            vfs_cache_max_age: self.vfs_cache_max_age.clone(),
            vfs_cache_poll_interval: self.vfs_cache_poll_interval.clone(),
            vfs_write_back: self.vfs_write_back.clone(),
            vfs_cache_max_size: self.vfs_cache_max_size,
            vfs_read_ahead: self.vfs_read_ahead,
            vfs_fast_finger_print: self.vfs_fast_finger_print,
            vfs_read_chunk_size: self.vfs_read_chunk_size,
            vfs_read_chunk_size_limit: self.vfs_read_chunk_size_limit,
            no_check_sum: self.no_check_sum,
            no_mod_time: self.no_mod_time,
            no_seek: self.no_seek,
            read_only: self.read_only,
            vfs_read_wait: self.vfs_read_wait.clone(),
            vfs_write_wait: self.vfs_write_wait.clone(),
            transfers: self.transfers,
            vfs_disk_space_total_size: self.vfs_disk_space_total_size,
            upload_cutoff: self.upload_cutoff,
            upload_chunk_size: self.upload_chunk_size,
            upload_concurrency: self.upload_concurrency,
            write_back_cache: self.write_back_cache,
            debug_http: self.debug_http,
            debug_fuse: self.debug_fuse,
        })
    }
}

/// Parameters for a distributed filesystem mount.
#[derive(Debug, Clone)]
pub struct FilesystemParams {
    pub gateway_id: String,
    pub access_token: String,
    pub master_addresses: String,
    pub sub_dir: String,
}

impl FilesystemParams {
    pub fn parse(
        attributes: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<Self, ParamError> {
        let fields = Fields::new(attributes, secrets);
        Ok(Self {
            gateway_id: fields.required(FIELD_GATEWAY_ID)?,
            access_token: fields.required(FIELD_ACCESS_TOKEN)?,
            master_addresses: fields.required(FIELD_MASTER_SERVER_ADDRESS)?,
            sub_dir: fields
                .optional(FIELD_SUB_DIR)
                .unwrap_or_else(|| "/".to_string()),
        })
    }

    pub fn init_command(&self, volume_id: &str, mount_path: &str) -> InitFilesystemMount {
        InitFilesystemMount {
            volume_id: volume_id.to_string(),
            gateway_id: self.gateway_id.clone(),
            mount_path: mount_path.to_string(),
            sub_dir: self.sub_dir.clone(),
        }
    }

    pub fn credentials(&self) -> crate::daemon::FilesystemCredentials {
        crate::daemon::FilesystemCredentials {
            master_addresses: self.master_addresses.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

/// Case-insensitive lookup over the two maps, attributes first.
struct Fields {
    attributes: HashMap<String, String>,
    secrets: HashMap<String, String>,
}

impl Fields {
    fn new(attributes: &HashMap<String, String>, secrets: &HashMap<String, String>) -> Self {
        let lower = |map: &HashMap<String, String>| {
            map.iter()
                .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
                .collect()
        };
        Self {
            attributes: lower(attributes),
            secrets: lower(secrets),
        }
    }

    fn optional(&self, field: &str) -> Option<String> {
        self.attributes
            .get(field)
            .or_else(|| self.secrets.get(field))
            .filter(|v| !v.is_empty())
            .cloned()
    }

    fn required(&self, field: &'static str) -> Result<String, ParamError> {
        self.optional(field).ok_or(ParamError::Missing(field))
    }

    fn bool(&self, field: &'static str) -> Result<Option<bool>, ParamError> {
        let Some(value) = self.optional(field) else {
            return Ok(None);
        };
        parse_bool(&value)
            .map(Some)
            .ok_or(ParamError::InvalidBool { field, value })
    }

    fn uint(&self, field: &'static str) -> Result<Option<u64>, ParamError> {
        self.optional(field)
            .map(|v| v.parse().map_err(|source| ParamError::InvalidNumber { field, source }))
            .transpose()
    }

    fn url(&self, field: &'static str) -> Result<Option<Url>, ParamError> {
        self.optional(field)
            .map(|v| {
                Url::parse(&v).map_err(|source| ParamError::InvalidUrl {
                    field,
                    value: v.clone(),
                    source,
                })
            })
            .transpose()
    }

    /// Durations are validated but kept verbatim: the helper parses
    /// the same syntax itself.
    fn duration(&self, field: &'static str) -> Result<Option<String>, ParamError> {
        let Some(value) = self.optional(field) else {
            return Ok(None);
        };
        if duration_syntax().is_match(&value) {
            Ok(Some(value))
        } else {
            Err(ParamError::InvalidDuration { field, value })
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "yes" | "true" | "y" | "on" => Some(true),
        "no" | "false" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn duration_syntax() -> &'static Regex {
    // Same shape the helper accepts: 300ms, 1.5h, 2h45m.
    static SYNTAX: OnceLock<Regex> = OnceLock::new();
    SYNTAX.get_or_init(|| Regex::new(r"^(\d+(\.\d+)?(ns|us|µs|ms|s|m|h))+$").unwrap())
}
