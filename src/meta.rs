//! Things that belong to NecroLua itself rather than to the game: settings, files on disk and
//! the console.

pub mod console;
pub mod resources;
pub mod settings;
