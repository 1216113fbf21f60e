//! Room configuration, sourced from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Metadata identifying the room, embedded in recording artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: String,
    pub created_at: String,
}

/// Everything a room session needs to run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bind_addr: String,
    /// Directory the shared file set and the shell live in.
    pub work_dir: PathBuf,
    /// File selected when the room starts.
    pub start_file: String,
    pub shell: String,
    /// Where crash logs and finalized recordings go.
    pub persistence_dir: PathBuf,
    /// PEM public key for verifying room tokens; absent means every
    /// tokenless or unverifiable join is a candidate and nobody is a host.
    pub jwt_public_key_path: Option<PathBuf>,
    pub platform_version: String,
    /// How long a dropped connection may claim its seat back.
    pub recovery_window: Duration,
    pub room: RoomInfo,
}

impl SessionConfig {
    /// Build a config from `INSIDER_*` environment variables, with
    /// defaults suitable for local development.
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        let recovery_secs = var("INSIDER_RECOVERY_WINDOW_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(120);

        Self {
            bind_addr: var("INSIDER_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:7171".into()),
            work_dir: var("INSIDER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("workspace")),
            start_file: var("INSIDER_START_FILE").unwrap_or_else(|| "main.txt".into()),
            shell: var("INSIDER_SHELL")
                .or_else(|| var("SHELL"))
                .unwrap_or_else(|| "bash".into()),
            persistence_dir: var("INSIDER_PERSISTENCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("recordings")),
            jwt_public_key_path: var("INSIDER_JWT_PUBLIC_KEY").map(PathBuf::from),
            platform_version: var("INSIDER_PLATFORM_VERSION").unwrap_or_else(|| "0.1.0".into()),
            recovery_window: Duration::from_secs(recovery_secs),
            room: RoomInfo {
                id: var("INSIDER_ROOM_ID").unwrap_or_else(|| "local".into()),
                name: var("INSIDER_ROOM_NAME").unwrap_or_else(|| "Local room".into()),
                room_type: var("INSIDER_ROOM_TYPE").unwrap_or_else(|| "interview".into()),
                created_at: var("INSIDER_ROOM_CREATED_AT").unwrap_or_default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_info_wire_names() {
        let info = RoomInfo {
            id: "r".into(),
            name: "n".into(),
            room_type: "interview".into(),
            created_at: "2026-08-01T00:00:00Z".into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "interview");
        assert_eq!(json["createdAt"], "2026-08-01T00:00:00Z");
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("INSIDER_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("INSIDER_RECOVERY_WINDOW_SECS", "30");
        let config = SessionConfig::from_env();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.recovery_window, Duration::from_secs(30));
        env::remove_var("INSIDER_BIND_ADDR");
        env::remove_var("INSIDER_RECOVERY_WINDOW_SECS");
    }
}
