//! NecroLua: a Lua mod API for Crypt of the NecroDancer.
//!
//! Built as a library, this is the payload that `necrolauncher` loads into the game. It sets up
//! logging, loads the game's symbols, starts LuaJIT and hands control to the bootstrap script,
//! which installs hooks through `nl_attach`/`nl_detach`. The launcher itself lives in
//! `src/bin/necrolauncher.rs` and uses the `launch` module.

pub mod hook;
pub mod host;
pub mod launch;
pub mod logging;
pub mod meta;
pub mod payload;
pub mod scripts;

#[cfg(windows)]
mod entry {
    use std::ffi::c_void;
    use windows::Win32::Foundation::{BOOL, HMODULE};
    use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    #[no_mangle]
    #[allow(non_snake_case)]
    unsafe extern "system" fn DllMain(module: HMODULE, reason: u32, _: *mut c_void) -> BOOL {
        match reason {
            DLL_PROCESS_ATTACH => {
                let _ = DisableThreadLibraryCalls(module);

                // The game's main thread is still suspended, so nothing else runs while the
                //  scripts install their hooks.
                crate::payload::initialize();
            }
            DLL_PROCESS_DETACH => crate::payload::finalize(),
            _ => {}
        }

        true.into()
    }
}
