//! Loads the settings shared by the launcher and the payload from `necrolua.json`.

use std::path::{Path, PathBuf};

use super::resources;

pub const SETTINGS_FILE: &str = "necrolua.json";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The game executable that the launcher starts.
    pub target: PathBuf,

    /// The payload library injected into the game.
    pub payload: PathBuf,

    /// Program database loaded for the game's main module.
    pub pdb: String,

    /// Directory scanned for mods.
    pub mods_dir: PathBuf,

    /// Directory that `require` searches first for the bootstrap script.
    pub script_root: PathBuf,

    /// Log file written by the payload. Relative paths are relative to the game directory.
    pub log_file: Option<PathBuf>,

    /// One of `off`, `error`, `warn`, `info`, `debug` or `trace`.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            target: PathBuf::from("NecroDancer.exe"),
            payload: PathBuf::from("necrolua.dll"),
            pdb: "NecroDancer.pdb".to_string(),
            mods_dir: PathBuf::from("mods"),
            script_root: PathBuf::from("."),
            log_file: Some(PathBuf::from("necrolua.log")),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn load_path(path: &Path) -> eyre::Result<Settings> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Loads the settings file from the game directory, falling back to the defaults if it
    /// is missing or malformed. A parse error is returned alongside the defaults so that the
    /// caller can log it once logging is up.
    pub fn load_or_default(path: &Path) -> (Settings, Option<eyre::Report>) {
        if !path.exists() {
            return (Settings::default(), None);
        }

        match Self::load_path(path) {
            Ok(settings) => (settings, None),
            Err(err) => (Settings::default(), Some(err)),
        }
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(resources::get_game_path)
    }
}

pub fn settings_path() -> PathBuf {
    resources::get_game_path(SETTINGS_FILE)
}
