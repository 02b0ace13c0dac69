use itertools::Itertools;
use std::path::{Path, PathBuf};

/*
    Game directory
      necrolua.json     Settings (optional).
      necrolua
        init.lua        The bootstrap script, loaded with `require("necrolua.init")`.
      mods
        example
          lua
            init.lua    Entry point for the mod named 'example'.

    A mod is any folder directly inside the mods directory that has a `lua/init.lua` file. The
    bootstrap script gets the list of entry points and decides what to do with them.
*/

/// Resolves `name` against the game directory. The launcher is started from the game
/// directory and the game inherits it, so this is the current directory.
pub fn get_game_path(name: impl AsRef<Path>) -> PathBuf {
    let name = name.as_ref();

    if name.is_absolute() {
        return name.to_path_buf();
    }

    match std::env::current_dir() {
        Ok(dir) => dir.join(name),
        Err(_) => name.to_path_buf(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mod {
    pub name: String,
    pub init: PathBuf,
}

impl Mod {
    fn from_dir(path: &Path) -> Option<Mod> {
        if !path.is_dir() {
            return None;
        }

        let name = path.file_name()?.to_str()?.to_string();
        let init = path.join("lua").join("init.lua");

        if !init.is_file() {
            log::debug!("skipping '{}': no lua/init.lua", name);
            return None;
        }

        Some(Mod { name, init })
    }
}

/// Finds every mod in `dir`, ordered by folder name.
pub fn find_mods(dir: &Path) -> Vec<Mod> {
    log::info!("Scanning mods in '{}' ...", dir.display());

    let entries = match dir.read_dir() {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("Unable to read mods directory '{}': {}", dir.display(), err);
            return vec![];
        }
    };

    entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(err) => {
                log::warn!("Error while reading mods directory: {}", err);
                None
            }
        })
        .sorted()
        .filter_map(|path| Mod::from_dir(&path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "necrolua-resources-{}-{}",
            name,
            std::process::id()
        ));

        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn make_mod(root: &Path, name: &str) {
        let lua = root.join(name).join("lua");
        fs::create_dir_all(&lua).unwrap();
        fs::write(lua.join("init.lua"), "return {}").unwrap();
    }

    #[test]
    fn finds_mods_in_name_order() {
        let root = scratch_dir("order");
        make_mod(&root, "zombies");
        make_mod(&root, "bard");
        make_mod(&root, "monk");

        let names: Vec<_> = find_mods(&root).into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["bard", "monk", "zombies"]);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn skips_things_that_are_not_mods() {
        let root = scratch_dir("skip");
        make_mod(&root, "real");

        // A loose file.
        fs::write(root.join("readme.txt"), "hi").unwrap();

        // A folder with no entry point.
        fs::create_dir_all(root.join("assets").join("lua")).unwrap();

        // An entry point that is a folder.
        fs::create_dir_all(root.join("odd").join("lua").join("init.lua")).unwrap();

        // An entry point in the wrong place.
        fs::create_dir_all(root.join("flat")).unwrap();
        fs::write(root.join("flat").join("init.lua"), "return {}").unwrap();

        let mods = find_mods(&root);
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].name, "real");
        assert_eq!(mods[0].init, root.join("real").join("lua").join("init.lua"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_directory_has_no_mods() {
        let root = scratch_dir("missing").join("nope");
        assert!(find_mods(&root).is_empty());
    }

    #[test]
    fn absolute_paths_are_untouched() {
        let path = std::env::temp_dir().join("necrolua.log");
        assert_eq!(get_game_path(&path), path);
        assert!(get_game_path("necrolua.log").is_absolute());
    }
}
