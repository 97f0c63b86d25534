use serde::{Deserialize, Serialize};

/// One protocol command, tagged on the wire by its envelope `cmd` name.
#[derive(Debug, Clone)]
pub enum Command {
    InitFilesystemMount(InitFilesystemMount),
    InitObjectStoreMount(Box<InitObjectStoreMount>),
    Umount(Umount),
    RequestData(RequestData),
    ResponseData(ResponseData),
    Terminate(Terminate),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::InitFilesystemMount(_) => super::INIT_FILESYSTEM_MOUNT,
            Command::InitObjectStoreMount(_) => super::INIT_OBJECT_STORE_MOUNT,
            Command::Umount(_) => super::UMOUNT,
            Command::RequestData(_) => super::REQUEST_DATA,
            Command::ResponseData(_) => super::RESPONSE_DATA,
            Command::Terminate(_) => super::TERMINATE,
        }
    }

    pub(super) fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Command::InitFilesystemMount(c) => serde_json::to_value(c),
            Command::InitObjectStoreMount(c) => serde_json::to_value(c),
            Command::Umount(c) => serde_json::to_value(c),
            Command::RequestData(c) => serde_json::to_value(c),
            Command::ResponseData(c) => serde_json::to_value(c),
            Command::Terminate(c) => serde_json::to_value(c),
        }
    }
}

/// Start a stratofs mount. Credentials are supplied interactively over
/// `RequestData`, not via a config file.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InitFilesystemMount {
    pub volume_id: String,
    pub gateway_id: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_dir: String,
}

/// Start an rclone-backed object store mount.
///
/// All tuning fields are optional: absent means "let the helper use its
/// own default", which is not the same as false/zero. Durations are
/// carried as the helper's own duration strings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InitObjectStoreMount {
    pub volume_id: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_dir: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket_id: String,
    pub s3_region: String,
    pub s3_endpoint: String,
    #[serde(default)]
    pub s3_force_path_style: bool,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_cache_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_cache_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_cache_max_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_cache_poll_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_write_back: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_cache_max_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_read_ahead: Option<u64>,
    #[serde(default)]
    pub vfs_fast_finger_print: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_read_chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_read_chunk_size_limit: Option<u64>,
    #[serde(default)]
    pub no_check_sum: bool,
    #[serde(default)]
    pub no_mod_time: bool,
    #[serde(default)]
    pub no_seek: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_read_wait: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_write_wait: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfers: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs_disk_space_total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_cutoff: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_concurrency: Option<u64>,
    #[serde(default)]
    pub write_back_cache: bool,
    #[serde(default)]
    pub debug_http: bool,
    #[serde(default)]
    pub debug_fuse: bool,
}

/// Purge the per-volume cache and log state the daemon created for a
/// mount. The unmount syscall itself is the client's job.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Umount {
    pub volume_id: String,
    pub mount_path: String,
}

/// Bytes to feed to the running helper's stdin.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestData {
    pub data: String,
}

/// A chunk of the helper's stdout (`is_error == false`) or stderr.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseData {
    pub data: String,
    pub is_error: bool,
}

/// Final message for a connection: the helper process exited.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Terminate {
    pub code: i32,
}
