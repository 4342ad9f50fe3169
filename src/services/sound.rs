use std::{path::PathBuf, sync::Arc};

use tracing::{debug, info};

use crate::{config::AppConfig, state::player::RoleId};

/// Which cue to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// A non-winning count arrived.
    Count,
    /// The role won.
    Win,
}

/// Side-effect collaborator notified on count updates and wins.
///
/// Implementations own asset lookup and playback and may ignore unknown roles.
pub trait SoundCues: Send + Sync {
    /// A non-winning count arrived for `role`.
    fn on_count_update(&self, role: RoleId);
    /// `role` won the round.
    fn on_win(&self, role: RoleId);
}

/// Resolves per-role audio assets from configuration and hands them to the external player.
pub struct AssetCues {
    config: Arc<AppConfig>,
}

impl AssetCues {
    /// Cues backed by the sound table of `config`.
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    /// Asset path for `role` and `cue`, or `None` when the role has no sounds.
    pub fn resolve(&self, role: RoleId, cue: Cue) -> Option<PathBuf> {
        let assets = self.config.sound_assets(role)?;
        let file = match cue {
            Cue::Count => &assets.count,
            Cue::Win => &assets.win,
        };
        Some(self.config.audio_dir.join(file))
    }

    fn play(&self, role: RoleId, cue: Cue) {
        match self.resolve(role, cue) {
            Some(asset) => info!(
                role = %self.config.role_name(role),
                cue = ?cue,
                asset = %asset.display(),
                "sound cue"
            ),
            None => debug!(role = %role, cue = ?cue, "no sound configured for role"),
        }
    }
}

impl SoundCues for AssetCues {
    fn on_count_update(&self, role: RoleId) {
        self.play(role, Cue::Count);
    }

    fn on_win(&self, role: RoleId) {
        self.play(role, Cue::Win);
    }
}
