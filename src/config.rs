//! Referee configuration loading: thresholds, directory lookup, player API and sound cues.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::state::player::RoleId;

/// Default location on disk where the referee looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/referee.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PUSHUP_REFEREE_CONFIG_PATH";

const DEFAULT_WIN_THRESHOLD: u32 = 10;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MULTICAST_ADDRESS: &str = "[ff02::1]";
const DEFAULT_LOOKUP_PATH: &str = "/endpoint-lookup/";
const DEFAULT_RESOURCE_TYPE: &str = "pushups_player";
const DEFAULT_AUDIO_DIR: &str = "audio";

/// Whether `reset` also clears `Won`/`Lost` and re-arms observation for a new round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Counts are zeroed; the round outcome is kept.
    #[default]
    KeepOutcome,
    /// Counts and outcome are cleared and a new round starts.
    ClearOutcome,
}

/// Resource the player firmware exposes for role assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleResource {
    /// `PUT /assign_color`.
    #[default]
    AssignColor,
    /// `PUT /assign_player_id`, used by older firmware.
    AssignPlayerId,
}

impl RoleResource {
    /// Resource path for this variant.
    pub fn path(self) -> &'static str {
        match self {
            RoleResource::AssignColor => "/assign_color",
            RoleResource::AssignPlayerId => "/assign_player_id",
        }
    }
}

/// Where and how to look up the resource directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Multicast host the directory discovery is sent to.
    pub multicast_address: String,
    /// Interface index used to scope link-local multicast.
    pub multicast_interface: Option<u32>,
    /// Upper bound on waiting for the first directory answer.
    pub timeout: Duration,
    /// Lookup interface of the directory (`/endpoint-lookup/` or `/resource-lookup/`).
    pub lookup_path: String,
    /// Resource type players advertise.
    pub resource_type: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            multicast_address: DEFAULT_MULTICAST_ADDRESS.into(),
            multicast_interface: None,
            timeout: DEFAULT_DIRECTORY_TIMEOUT,
            lookup_path: DEFAULT_LOOKUP_PATH.into(),
            resource_type: DEFAULT_RESOURCE_TYPE.into(),
        }
    }
}

/// Audio assets played for a role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SoundAssets {
    /// Played on every non-winning count update.
    pub count: String,
    /// Played when the role wins.
    pub win: String,
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the referee.
pub struct AppConfig {
    /// Count that wins a round.
    pub win_threshold: u32,
    /// Upper bound for a single CoAP exchange.
    pub request_timeout: Duration,
    /// What `reset` does to a decided round.
    pub reset_policy: ResetPolicy,
    /// Endpoint resource used for role assignment.
    pub role_resource: RoleResource,
    /// Resource directory discovery settings.
    pub directory: DirectoryConfig,
    role_names: Vec<String>,
    /// Directory the sound asset names are relative to.
    pub audio_dir: PathBuf,
    sounds: IndexMap<String, SoundAssets>,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        win_threshold = app_config.win_threshold,
                        reset_policy = ?app_config.reset_policy,
                        "loaded referee config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Override the winning count.
    pub fn with_win_threshold(mut self, threshold: u32) -> Self {
        self.win_threshold = threshold;
        self
    }

    /// Override the reset policy.
    pub fn with_reset_policy(mut self, policy: ResetPolicy) -> Self {
        self.reset_policy = policy;
        self
    }

    /// Display name for `role`; roles past the configured list read `PLAYER<n>`.
    pub fn role_name(&self, role: RoleId) -> String {
        self.role_names
            .get(usize::from(role.0))
            .cloned()
            .unwrap_or_else(|| format!("PLAYER{}", role.0))
    }

    /// Assets configured for `role`, if any.
    pub fn sound_assets(&self, role: RoleId) -> Option<&SoundAssets> {
        self.sounds.get(&self.role_name(role))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            win_threshold: DEFAULT_WIN_THRESHOLD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reset_policy: ResetPolicy::default(),
            role_resource: RoleResource::default(),
            directory: DirectoryConfig::default(),
            role_names: default_role_names(),
            audio_dir: PathBuf::from(DEFAULT_AUDIO_DIR),
            sounds: default_sounds(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    win_threshold: Option<u32>,
    request_timeout_ms: Option<u64>,
    reset_policy: Option<ResetPolicy>,
    role_resource: Option<RoleResource>,
    directory: Option<RawDirectory>,
    role_names: Option<Vec<String>>,
    audio_dir: Option<PathBuf>,
    sounds: Option<IndexMap<String, SoundAssets>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDirectory {
    multicast_address: Option<String>,
    multicast_interface: Option<u32>,
    timeout_ms: Option<u64>,
    lookup_path: Option<String>,
    resource_type: Option<String>,
}

impl From<RawDirectory> for DirectoryConfig {
    fn from(value: RawDirectory) -> Self {
        let defaults = DirectoryConfig::default();
        Self {
            multicast_address: value.multicast_address.unwrap_or(defaults.multicast_address),
            multicast_interface: value.multicast_interface,
            timeout: value
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            lookup_path: value.lookup_path.unwrap_or(defaults.lookup_path),
            resource_type: value.resource_type.unwrap_or(defaults.resource_type),
        }
    }
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = AppConfig::default();
        Self {
            win_threshold: value.win_threshold.unwrap_or(defaults.win_threshold),
            request_timeout: value
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            reset_policy: value.reset_policy.unwrap_or(defaults.reset_policy),
            role_resource: value.role_resource.unwrap_or(defaults.role_resource),
            directory: value.directory.map(Into::into).unwrap_or(defaults.directory),
            role_names: value
                .role_names
                .filter(|names| !names.is_empty())
                .unwrap_or(defaults.role_names),
            audio_dir: value.audio_dir.unwrap_or(defaults.audio_dir),
            sounds: value.sounds.unwrap_or(defaults.sounds),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn default_role_names() -> Vec<String> {
    ["OFF", "RED", "GREEN", "BLUE"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sounds() -> IndexMap<String, SoundAssets> {
    IndexMap::from([
        (
            "RED".to_string(),
            SoundAssets {
                count: "rot.mp3".into(),
                win: "rot_hat_gewonnen.mp3".into(),
            },
        ),
        (
            "GREEN".to_string(),
            SoundAssets {
                count: "gruen.mp3".into(),
                win: "gruen_hat_gewonnen.mp3".into(),
            },
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "win_threshold": 4,
                "reset_policy": "clear_outcome",
                "role_resource": "assign_player_id",
                "directory": { "lookup_path": "/resource-lookup/", "timeout_ms": 250 }
            }"#,
        )
        .unwrap();
        let config: AppConfig = raw.into();

        assert_eq!(config.win_threshold, 4);
        assert_eq!(config.reset_policy, ResetPolicy::ClearOutcome);
        assert_eq!(config.role_resource.path(), "/assign_player_id");
        assert_eq!(config.directory.lookup_path, "/resource-lookup/");
        assert_eq!(config.directory.timeout, Duration::from_millis(250));
        assert_eq!(config.directory.resource_type, "pushups_player");
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn role_names_fall_back_past_the_configured_list() {
        let config = AppConfig::default();
        assert_eq!(config.role_name(RoleId::OFF), "OFF");
        assert_eq!(config.role_name(RoleId(2)), "GREEN");
        assert_eq!(config.role_name(RoleId(7)), "PLAYER7");
    }

    #[test]
    fn sound_assets_exist_only_for_configured_roles() {
        let config = AppConfig::default();
        assert_eq!(config.sound_assets(RoleId(1)).unwrap().count, "rot.mp3");
        assert!(config.sound_assets(RoleId(3)).is_none());
    }

    #[test]
    fn empty_role_name_list_is_ignored() {
        let raw: RawConfig = serde_json::from_str(r#"{ "role_names": [] }"#).unwrap();
        let config: AppConfig = raw.into();
        assert_eq!(config.role_name(RoleId(1)), "RED");
    }
}
