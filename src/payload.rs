//! Brings the mod API up inside the game, and (doesn't) take it down again.

use eyre::Result;
use once_cell::sync::OnceCell;
use std::sync::Mutex;

use crate::logging::{self, Component};
use crate::meta::{console, resources, settings::Settings};
use crate::scripts::{self, Runtime};

pub const DLL_NAME: &str = "necrolua";

// Never closed: scripts keep FFI callbacks into this state installed as hooks.
static RUNTIME: OnceCell<Mutex<Runtime>> = OnceCell::new();

fn start_runtime(settings: &Settings) -> Result<Runtime> {
    log::info!("Opening the Lua state ...");
    let runtime = Runtime::new(DLL_NAME, &scripts::script_root(&settings.script_root))?;

    runtime.bootstrap()?;

    let mods_dir = resources::get_game_path(&settings.mods_dir);
    let mods = resources::find_mods(&mods_dir);

    for found in &mods {
        log::debug!("found mod '{}' at {}", found.name, found.init.display());
    }

    runtime.reload_mods(&mods)?;
    Ok(runtime)
}

/// Sets everything up. Lua errors are fatal and end the process.
pub fn initialize() {
    let (settings, settings_err) =
        Settings::load_or_default(&crate::meta::settings::settings_path());

    // Attach first so that anything logged below reaches the launcher's console.
    let attached = console::attach_parent();

    logging::init(
        Component::Payload,
        settings.level_filter(),
        settings.log_path().as_deref(),
    );

    match attached {
        Ok(true) => log::debug!("attached to the parent console"),
        Ok(false) => {}
        Err(err) => log::warn!("{:?}", err),
    }

    if let Some(err) = settings_err {
        log::error!("Failed to load settings from JSON: {:?}", err);
        log::info!("Using default values instead.");
    }

    log::info!("Loading symbol information ...");

    match crate::host::load_symbols(&settings.pdb) {
        Ok(base) => log::info!("BaseOfExe is {:#010x}", base),
        Err(err) => log::warn!("Continuing without symbols: {:?}", err),
    }

    let runtime = match start_runtime(&settings) {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("Lua error: {:?}", err);
            logging::flush();
            std::process::exit(1);
        }
    };

    if RUNTIME.set(Mutex::new(runtime)).is_err() {
        log::warn!("Lua state already exists.");
    }

    log::info!("Mods initialized.");
}

pub fn finalize() {
    // Closing Lua or unloading symbols here can deadlock on the loader lock, so the process
    //  exit is left to clean up.
    log::info!("Mod API finalized.");
    logging::flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "necrolua-payload-{}-{}",
            name,
            std::process::id()
        ));

        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn runtime_receives_discovered_mods() {
        let root = scratch_dir("mods");
        let scripts = root.join("scripts");
        let mods = root.join("mods");

        write(
            &scripts.join("necrolua").join("init.lua"),
            r#"
local M = {}

function M.reload(mods)
    M.mods = mods
end

return M
"#,
        );

        write(&mods.join("monk").join("lua").join("init.lua"), "");
        write(&mods.join("bard").join("lua").join("init.lua"), "");
        fs::create_dir_all(mods.join("assets")).unwrap();

        let settings = Settings {
            script_root: scripts,
            mods_dir: mods.clone(),
            ..Settings::default()
        };

        let runtime = start_runtime(&settings).unwrap();

        let inits: Vec<String> = runtime
            .lua()
            .load("return necrolua.mods")
            .eval()
            .unwrap();

        assert_eq!(
            inits,
            [
                mods.join("bard").join("lua").join("init.lua"),
                mods.join("monk").join("lua").join("init.lua"),
            ]
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn bootstrap_failure_is_reported() {
        let root = scratch_dir("broken");
        write(
            &root.join("necrolua").join("init.lua"),
            "return { reload = function() error('bad mod list') end }",
        );

        let settings = Settings {
            script_root: root.clone(),
            mods_dir: root.join("mods"),
            ..Settings::default()
        };

        let err = start_runtime(&settings).err().unwrap();
        assert!(format!("{:?}", err).contains("bad mod list"));

        let _ = fs::remove_dir_all(&root);
    }
}
