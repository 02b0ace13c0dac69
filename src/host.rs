//! Information about the game process that scripts need in order to find game code: the
//! process handle and the base address the game's symbols were loaded at.

#![allow(non_upper_case_globals)]

use std::ffi::c_void;

/// Handle to the game process, for scripts that call DbgHelp themselves.
#[no_mangle]
pub static mut nl_hProcess: *mut c_void = std::ptr::null_mut();

/// Base address of the game's module as reported by the symbol loader. Zero until symbols
/// have been loaded.
#[no_mangle]
pub static mut nl_BaseOfDll: u64 = 0;

pub fn base_of_dll() -> u64 {
    unsafe { std::ptr::addr_of!(nl_BaseOfDll).read() }
}

#[cfg(windows)]
mod symbols {
    use cached::proc_macro::cached;
    use eyre::{eyre, Result, WrapErr};
    use std::ffi::{c_void, CString};
    use windows::core::{PCSTR, PCWSTR};
    use windows::Win32::Foundation::{BOOL, HANDLE};
    use windows::Win32::System::Diagnostics::Debug::{
        SymFromName, SymInitialize, SymLoadModuleEx, SYMBOL_INFO, SYM_LOAD_FLAGS,
    };
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;

    const MAX_SYMBOL_NAME: usize = 1024;

    pub fn load(pdb_name: &str) -> Result<u64> {
        unsafe {
            let process = GetCurrentProcess();
            std::ptr::addr_of_mut!(super::nl_hProcess).write(process.0 as *mut c_void);

            SymInitialize(process, PCSTR::null(), BOOL::from(false))
                .wrap_err("failed to initialise the symbol handler")?;

            let module =
                GetModuleHandleW(PCWSTR::null()).wrap_err("failed to get the game's module")?;

            let mut info = MODULEINFO::default();
            GetModuleInformation(
                process,
                module,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
            .wrap_err("failed to get module information")?;

            log::debug!(
                "game image is at {:p}, {:#x} bytes",
                info.lpBaseOfDll,
                info.SizeOfImage
            );

            let image = CString::new(pdb_name)?;

            let base = SymLoadModuleEx(
                process,
                HANDLE::default(),
                PCSTR(image.as_ptr().cast()),
                PCSTR::null(),
                info.lpBaseOfDll as u64,
                info.SizeOfImage,
                None,
                SYM_LOAD_FLAGS(0),
            );

            if base == 0 {
                return Err(eyre!(
                    "unable to load {}: {}",
                    pdb_name,
                    windows::core::Error::from_win32()
                ));
            }

            std::ptr::addr_of_mut!(super::nl_BaseOfDll).write(base);
            Ok(base)
        }
    }

    #[cached]
    pub fn address_of(name: String) -> Option<u64> {
        let name = CString::new(name).ok()?;

        // SYMBOL_INFO is followed in memory by the rest of the name buffer.
        let words = (std::mem::size_of::<SYMBOL_INFO>() + MAX_SYMBOL_NAME) / 8 + 1;
        let mut buffer = vec![0u64; words];
        let info = buffer.as_mut_ptr().cast::<SYMBOL_INFO>();

        unsafe {
            (*info).SizeOfStruct = std::mem::size_of::<SYMBOL_INFO>() as u32;
            (*info).MaxNameLen = MAX_SYMBOL_NAME as u32;

            SymFromName(GetCurrentProcess(), PCSTR(name.as_ptr().cast()), info).ok()?;
            Some((*info).Address)
        }
    }
}

/// Loads the symbols in `pdb_name` for the game's main module, publishing the process handle
/// and module base through the exported globals. Returns the module base.
#[cfg(windows)]
pub fn load_symbols(pdb_name: &str) -> eyre::Result<u64> {
    symbols::load(pdb_name)
}

#[cfg(not(windows))]
pub fn load_symbols(pdb_name: &str) -> eyre::Result<u64> {
    Err(eyre::eyre!(
        "cannot load {}: PDB symbols are only available on Windows",
        pdb_name
    ))
}

/// Looks up the address of a game symbol by name. Results are cached.
pub fn address_of(name: &str) -> Option<u64> {
    if base_of_dll() == 0 {
        return None;
    }

    #[cfg(windows)]
    {
        symbols::address_of(name.to_string())
    }

    #[cfg(not(windows))]
    {
        let _ = name;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_symbols_before_loading() {
        assert_eq!(base_of_dll(), 0);
        assert_eq!(address_of("necrodancer::Player::update"), None);
    }

    #[cfg(not(windows))]
    #[test]
    fn loading_symbols_needs_windows() {
        let err = load_symbols("NecroDancer.pdb").unwrap_err();
        assert!(err.to_string().contains("NecroDancer.pdb"));
    }
}
