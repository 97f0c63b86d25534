//! Translation of mount commands into helper argument vectors.
//!
//! These are pure: they only build the argv, spawning belongs to the
//! process supervisor.

use std::path::PathBuf;

use super::commands::{InitFilesystemMount, InitObjectStoreMount};

/// Helper executable performing object store mounts.
pub const OBJECT_STORE_HELPER: &str = "rclone";
/// Helper executable performing distributed filesystem mounts.
pub const FILESYSTEM_HELPER: &str = "stratofs";
/// Required for FUSE unmounts performed by the plugin.
pub const FUSERMOUNT_HELPER: &str = "fusermount3";

/// Per-mount inputs the daemon resolves before spawning: everything the
/// argv needs beyond the wire command itself.
#[derive(Debug, Clone)]
pub struct MountContext {
    pub config_path: PathBuf,
    pub user_agent: String,
    pub log_file: PathBuf,
    pub cache_dir: PathBuf,
}

/// Build the rclone argv for an object store mount.
pub fn object_store_mount_args(cmd: &InitObjectStoreMount, ctx: &MountContext) -> Vec<String> {
    let mut args = vec![
        "--auto-confirm".to_string(),
        "--config".to_string(),
        ctx.config_path.display().to_string(),
        "--user-agent".to_string(),
        format!("{}/{}", ctx.user_agent, cmd.volume_id),
        "--log-file".to_string(),
        ctx.log_file.display().to_string(),
    ];
    if let Some(size) = cmd.buffer_size {
        args.push("--buffer-size".to_string());
        args.push(format_byte_size(size));
    }
    if let Some(transfers) = cmd.transfers {
        args.push("--transfers".to_string());
        args.push(transfers.to_string());
    }
    if cmd.debug_http {
        args.push("--verbose".to_string());
        args.push("--dump".to_string());
        args.push("headers".to_string());
    }

    args.push("mount".to_string());
    args.push("--daemon".to_string());
    args.push("--cache-dir".to_string());
    args.push(ctx.cache_dir.display().to_string());

    let mut flag = |name: &str, value: Option<String>| {
        args.push(name.to_string());
        if let Some(value) = value {
            args.push(value);
        }
    };
    if let Some(ref d) = cmd.dir_cache_duration {
        flag("--dir-cache-time", Some(d.clone()));
    }
    if let Some(ref mode) = cmd.vfs_cache_mode {
        flag("--vfs-cache-mode", Some(mode.clone()));
    }
    if let Some(ref age) = cmd.vfs_cache_max_age {
        flag("--vfs-cache-max-age", Some(age.clone()));
    }
    if let Some(size) = cmd.vfs_cache_max_size {
        flag("--vfs-cache-max-size", Some(format_byte_size(size)));
    }
    if let Some(ref interval) = cmd.vfs_cache_poll_interval {
        flag("--vfs-cache-poll-interval", Some(interval.clone()));
    }
    if let Some(size) = cmd.vfs_read_ahead {
        flag("--vfs-read-ahead", Some(format_byte_size(size)));
    }
    if cmd.vfs_fast_finger_print {
        flag("--vfs-fast-fingerprint", None);
    }
    if let Some(ref d) = cmd.vfs_write_back {
        flag("--vfs-write-back", Some(d.clone()));
    }
    if let Some(size) = cmd.vfs_read_chunk_size {
        flag("--vfs-read-chunk-size", Some(format_byte_size(size)));
    }
    if let Some(size) = cmd.vfs_read_chunk_size_limit {
        flag("--vfs-read-chunk-size-limit", Some(format_byte_size(size)));
    }
    if cmd.no_check_sum {
        flag("--no-checksum", None);
    }
    if cmd.no_mod_time {
        flag("--no-modtime", None);
    }
    if cmd.no_seek {
        flag("--no-seek", None);
    }
    if cmd.read_only {
        flag("--read-only", None);
    }
    if let Some(ref d) = cmd.vfs_read_wait {
        flag("--vfs-read-wait", Some(d.clone()));
    }
    if let Some(ref d) = cmd.vfs_write_wait {
        flag("--vfs-write-wait", Some(d.clone()));
    }
    if let Some(size) = cmd.vfs_disk_space_total_size {
        flag("--vfs-disk-space-total-size", Some(format_byte_size(size)));
    }
    if cmd.write_back_cache {
        flag("--write-back-cache", None);
    }
    if cmd.debug_fuse {
        flag("--debug-fuse", None);
    }

    args.push(format!(
        "{}:{}/{}",
        cmd.volume_id,
        cmd.bucket_id,
        normalize_sub_dir(&cmd.sub_dir)
    ));
    args.push(cmd.mount_path.clone());
    args
}

/// Build the stratofs argv for a distributed filesystem mount.
pub fn filesystem_mount_args(cmd: &InitFilesystemMount) -> Vec<String> {
    vec![
        "mount".to_string(),
        cmd.gateway_id.clone(),
        cmd.mount_path.clone(),
        "-s".to_string(),
        cmd.sub_dir.clone(),
        "--force_reinit".to_string(),
    ]
}

/// Bucket sub-directories are object key prefixes: no leading slash,
/// trailing slash enforced for non-empty values.
fn normalize_sub_dir(sub_dir: &str) -> String {
    let mut key = sub_dir.trim_start_matches('/').to_string();
    if !key.is_empty() && !key.ends_with('/') {
        key.push('/');
    }
    key
}

/// rclone takes byte-size flags with a unit suffix; `b` means bytes.
fn format_byte_size(size: u64) -> String {
    format!("{size}b")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cmd() -> InitObjectStoreMount {
        InitObjectStoreMount {
            volume_id: "v1".into(),
            mount_path: "/mnt/v1".into(),
            bucket_id: "b1".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            s3_region: "r1".into(),
            s3_endpoint: "http://s3.example.com".into(),
            storage_class: "STANDARD".into(),
            ..Default::default()
        }
    }

    fn base_ctx() -> MountContext {
        MountContext {
            config_path: "/etc/stratus/v1.conf".into(),
            user_agent: "StratusCSIDriver/0.3.2".into(),
            log_file: "/var/log/stratus-rclone/v1/abc.log".into(),
            cache_dir: "/var/cache/stratus-rclone/v1/abc".into(),
        }
    }

    #[test]
    fn object_store_args_without_optionals() {
        let args = object_store_mount_args(&base_cmd(), &base_ctx());
        assert_eq!(
            args,
            vec![
                "--auto-confirm",
                "--config",
                "/etc/stratus/v1.conf",
                "--user-agent",
                "StratusCSIDriver/0.3.2/v1",
                "--log-file",
                "/var/log/stratus-rclone/v1/abc.log",
                "mount",
                "--daemon",
                "--cache-dir",
                "/var/cache/stratus-rclone/v1/abc",
                "v1:b1/",
                "/mnt/v1",
            ]
        );
    }

    #[test]
    fn only_set_optionals_are_emitted() {
        let mut cmd = base_cmd();
        cmd.buffer_size = Some(1048576);
        cmd.read_only = true;
        let args = object_store_mount_args(&cmd, &base_ctx());

        let buffer_at = args.iter().position(|a| a == "--buffer-size").unwrap();
        assert_eq!(args[buffer_at + 1], "1048576b");
        assert!(args.contains(&"--read-only".to_string()));

        for absent in [
            "--vfs-cache-mode",
            "--dir-cache-time",
            "--vfs-cache-max-size",
            "--transfers",
            "--no-checksum",
            "--write-back-cache",
            "--debug-fuse",
            "--verbose",
        ] {
            assert!(!args.contains(&absent.to_string()), "unexpected {absent}");
        }
    }

    #[test]
    fn sub_dir_is_normalized_into_source() {
        let mut cmd = base_cmd();
        cmd.sub_dir = "/backups/daily".into();
        let args = object_store_mount_args(&cmd, &base_ctx());
        assert_eq!(args[args.len() - 2], "v1:b1/backups/daily/");

        cmd.sub_dir = "/".into();
        let args = object_store_mount_args(&cmd, &base_ctx());
        assert_eq!(args[args.len() - 2], "v1:b1/");
    }

    #[test]
    fn debug_http_expands_to_dump_flags() {
        let mut cmd = base_cmd();
        cmd.debug_http = true;
        let args = object_store_mount_args(&cmd, &base_ctx());
        let verbose_at = args.iter().position(|a| a == "--verbose").unwrap();
        assert_eq!(&args[verbose_at..verbose_at + 3], ["--verbose", "--dump", "headers"]);
        // Global flags come before the mount subcommand.
        assert!(verbose_at < args.iter().position(|a| a == "mount").unwrap());
    }

    #[test]
    fn filesystem_args() {
        let cmd = InitFilesystemMount {
            volume_id: "v1".into(),
            gateway_id: "gw-7".into(),
            mount_path: "/mnt/v1".into(),
            sub_dir: "/".into(),
        };
        assert_eq!(
            filesystem_mount_args(&cmd),
            vec!["mount", "gw-7", "/mnt/v1", "-s", "/", "--force_reinit"]
        );
    }
}
