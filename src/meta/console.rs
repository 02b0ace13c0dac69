//! Console plumbing: the launcher turns on ANSI colours, and the game (which has no console of
//! its own) borrows the launcher's.

#[cfg(windows)]
mod imp {
    use eyre::{Result, WrapErr};
    use std::fs::OpenOptions;
    use std::os::windows::io::IntoRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        AttachConsole, GetConsoleMode, GetConsoleWindow, GetStdHandle, SetConsoleMode,
        SetStdHandle, ATTACH_PARENT_PROCESS, CONSOLE_MODE, ENABLE_VIRTUAL_TERMINAL_PROCESSING,
        STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
    };

    pub struct VirtualTerminal {
        saved: Vec<(HANDLE, CONSOLE_MODE)>,
    }

    impl VirtualTerminal {
        pub fn enable() -> VirtualTerminal {
            let mut saved = vec![];

            for std_handle in [STD_OUTPUT_HANDLE, STD_ERROR_HANDLE] {
                unsafe {
                    let Ok(handle) = GetStdHandle(std_handle) else {
                        continue;
                    };

                    let mut mode = CONSOLE_MODE::default();

                    // Fails when redirected to a file, which is fine.
                    if GetConsoleMode(handle, &mut mode).is_err() {
                        continue;
                    }

                    if SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING).is_ok() {
                        saved.push((handle, mode));
                    }
                }
            }

            VirtualTerminal { saved }
        }
    }

    impl Drop for VirtualTerminal {
        fn drop(&mut self) {
            for &(handle, mode) in &self.saved {
                unsafe {
                    let _ = SetConsoleMode(handle, mode);
                }
            }
        }
    }

    fn redirect(std_handle: STD_HANDLE, device: &str, write: bool) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(device)
            .wrap_err_with(|| format!("unable to open {}", device))?;

        unsafe {
            SetStdHandle(std_handle, HANDLE(file.into_raw_handle() as isize))?;
        }

        Ok(())
    }

    pub fn attach_parent() -> Result<bool> {
        unsafe {
            if GetConsoleWindow().0 != 0 {
                return Ok(false);
            }

            AttachConsole(ATTACH_PARENT_PROCESS).wrap_err("no parent console to attach to")?;
        }

        redirect(STD_OUTPUT_HANDLE, "CONOUT$", true)?;
        redirect(STD_ERROR_HANDLE, "CONOUT$", true)?;
        redirect(STD_INPUT_HANDLE, "CONIN$", false)?;

        Ok(true)
    }
}

#[cfg(not(windows))]
mod imp {
    pub struct VirtualTerminal;

    impl VirtualTerminal {
        pub fn enable() -> VirtualTerminal {
            VirtualTerminal
        }
    }

    pub fn attach_parent() -> eyre::Result<bool> {
        Ok(false)
    }
}

/// Enables ANSI escape sequences on stdout and stderr until dropped, at which point the
/// previous console modes are restored.
pub use imp::VirtualTerminal;

/// Attaches to the parent process's console if this process doesn't have one, and points the
/// standard handles at it. Returns whether a console was attached.
pub use imp::attach_parent;
