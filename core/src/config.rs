/// Configuration management
use crate::error::{ChatError, Result};
use crate::messenger_types::UserProfile;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_COLLECTION_ROOT: &str = "conversations";
const DEFAULT_USERS_COLLECTION: &str = "users";
const DEFAULT_MAX_INLINE_BYTES: usize = 750 * 1024;
const DEFAULT_EVENT_BUFFER: usize = 256;
const DEFAULT_LOG_FILTER: &str = "info";

/// Per-session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signed-in user; authentication happens elsewhere
    pub user: UserProfile,

    /// Collection holding conversation records; messages live under
    /// `<root>/<conversation id>/messages`
    pub collection_root: String,

    /// Collection holding user profiles
    pub users_collection: String,

    /// Directory for the local document store (in-memory when unset)
    pub data_dir: Option<PathBuf>,

    /// Largest image inlined into a message record
    pub max_inline_attachment_bytes: usize,

    /// Deliver unconfirmed writes with a null timestamp before the confirmed one
    pub latency_compensation: bool,

    /// Capacity of the UI event channel
    pub event_buffer: usize,

    /// Tracing filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: UserProfile::new("anonymous", "Anonymous"),
            collection_root: DEFAULT_COLLECTION_ROOT.to_string(),
            users_collection: DEFAULT_USERS_COLLECTION.to_string(),
            data_dir: None,
            max_inline_attachment_bytes: DEFAULT_MAX_INLINE_BYTES,
            latency_compensation: true,
            event_buffer: DEFAULT_EVENT_BUFFER,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn for_user(user: UserProfile) -> Self {
        Self {
            user,
            ..Default::default()
        }
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <user_id> [--name <display name>] [--avatar <url>] [--data-dir <path>] [--root <collection>] [--log <filter>] [--no-latency-compensation]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let uid = args[1].trim().to_string();
        if uid.is_empty() || uid.starts_with("--") {
            return Err(ChatError::Config("User id must come first".to_string()));
        }

        let mut display_name: Option<String> = None;
        let mut photo_url: Option<String> = None;
        let mut data_dir: Option<PathBuf> = None;
        let mut collection_root: Option<String> = None;
        let mut latency_compensation = true;
        let mut log_filter: Option<String> = None;

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--name" => {
                    display_name = Some(flag_value(args, i, "--name")?.to_string());
                    i += 2;
                }
                "--avatar" => {
                    photo_url = Some(flag_value(args, i, "--avatar")?.to_string());
                    i += 2;
                }
                "--data-dir" => {
                    data_dir = Some(PathBuf::from(flag_value(args, i, "--data-dir")?));
                    i += 2;
                }
                "--root" => {
                    collection_root = Some(flag_value(args, i, "--root")?.to_string());
                    i += 2;
                }
                "--log" => {
                    log_filter = Some(flag_value(args, i, "--log")?.to_string());
                    i += 2;
                }
                "--no-latency-compensation" => {
                    latency_compensation = false;
                    i += 1;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                data_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(root) = std::env::var("CHATSYNC_ROOT") {
            if !root.is_empty() {
                collection_root = Some(root);
            }
        }
        if std::env::var("CHATSYNC_NO_LATENCY_COMPENSATION").is_ok() {
            latency_compensation = false;
        }

        let collection_root = collection_root.unwrap_or_else(|| DEFAULT_COLLECTION_ROOT.to_string());
        if collection_root.is_empty() || collection_root.contains('/') {
            return Err(ChatError::Config(
                "--root must be a single collection name".to_string(),
            ));
        }

        Ok(Self {
            user: UserProfile {
                display_name: display_name.unwrap_or_else(|| uid.clone()),
                uid,
                photo_url,
            },
            collection_root,
            data_dir,
            latency_compensation,
            log_filter: log_filter.unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            ..Default::default()
        })
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_args_defaults() {
        let config = Config::from_args(&args(&["chatsync", "alice"])).unwrap();
        assert_eq!(config.user.uid, "alice");
        assert_eq!(config.user.display_name, "alice");
        assert_eq!(config.users_collection, "users");
        assert_eq!(config.max_inline_attachment_bytes, DEFAULT_MAX_INLINE_BYTES);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_from_args_flags() {
        let config = Config::from_args(&args(&[
            "chatsync",
            "alice",
            "--name",
            "Alice L.",
            "--avatar",
            "https://img/a.png",
            "--log",
            "chatsync_core=debug",
            "--no-latency-compensation",
        ]))
        .unwrap();
        assert_eq!(config.log_filter, "chatsync_core=debug");
        assert_eq!(config.user.display_name, "Alice L.");
        assert_eq!(config.user.photo_url.as_deref(), Some("https://img/a.png"));
        assert!(!config.latency_compensation);
    }

    #[test]
    fn test_from_args_errors() {
        assert!(Config::from_args(&args(&["chatsync"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "alice", "--name"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "alice", "--bogus"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "alice", "--root", "a/b"])).is_err());
    }
}
