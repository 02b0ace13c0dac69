//! Starts the game with the NecroLua payload loaded, and exits with the game's exit code.

use necrolua::launch;
use necrolua::logging::{self, Component};
use necrolua::meta::console::VirtualTerminal;
use necrolua::meta::resources;
use necrolua::meta::settings::{self, Settings};

#[cfg(windows)]
fn run(settings: &Settings) -> i32 {
    let target = resources::get_game_path(&settings.target);
    let payload = resources::get_game_path(&settings.payload);
    let command_line =
        launch::build_command_line(target.as_os_str(), std::env::args_os().skip(1));

    let child = match launch::launch(&target, &command_line, &payload) {
        Ok(child) => child,
        Err(err) => {
            log::error!("{:?}", err);
            logging::flush();

            let title = std::env::args().next().unwrap_or_default();
            launch::error_box(
                &title,
                &format!("Could not launch {}", settings.target.display()),
            );

            return 1;
        }
    };

    log::info!("Waiting for the game to exit ...");

    match child.wait() {
        Ok(code) => {
            log::info!("Done with exit code {:#010X}", code);
            code as i32
        }
        Err(err) => {
            log::error!("{:?}", err);
            1
        }
    }
}

#[cfg(not(windows))]
fn run(settings: &Settings) -> i32 {
    let command_line = launch::build_command_line(
        resources::get_game_path(&settings.target).as_os_str(),
        std::env::args_os().skip(1),
    );

    log::error!("Could not launch {}: Windows only", command_line);
    1
}

fn main() {
    let code = {
        // Restores the console modes before we exit.
        let _terminal = VirtualTerminal::enable();

        let (settings, settings_err) = Settings::load_or_default(&settings::settings_path());

        // The payload writes the log file; the launcher only prints.
        logging::init(Component::Launcher, settings.level_filter(), None);

        if let Some(err) = settings_err {
            log::error!("Failed to load settings from JSON: {:?}", err);
            log::info!("Using default values instead.");
        }

        let code = run(&settings);
        logging::flush();
        code
    };

    std::process::exit(code);
}
