//! Starting the game with the payload loaded.
//!
//! The game is created suspended, the payload is loaded by a `LoadLibraryW` thread in the new
//! process, and only then is the game's main thread allowed to run. The payload therefore gets
//! to install hooks before any game code has executed.

use itertools::Itertools;
use std::ffi::OsStr;

/// Quotes `arg` so that `CommandLineToArgvW` (and the MSVC runtime) give it back unchanged.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\x0b', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');

    let mut backslashes = 0;

    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Every backslash before a quote is escaped, and so is the quote.
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            c => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }

    // Backslashes before the closing quote would escape it.
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');

    quoted
}

/// Builds the game's command line: the program followed by the launcher's own arguments.
pub fn build_command_line<I, S>(program: &OsStr, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    std::iter::once(quote_arg(&program.to_string_lossy()))
        .chain(
            args.into_iter()
                .map(|arg| quote_arg(&arg.as_ref().to_string_lossy())),
        )
        .join(" ")
}

#[cfg(windows)]
mod imp {
    use eyre::{eyre, Result, WrapErr};
    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use windows::core::{s, w, PCWSTR, PWSTR};
    use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, HWND};
    use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
    use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
    use windows::Win32::System::Memory::{
        VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{
        CreateProcessW, CreateRemoteThread, GetExitCodeProcess, GetExitCodeThread, ResumeThread,
        TerminateProcess, WaitForSingleObject, CREATE_SUSPENDED, INFINITE, PROCESS_INFORMATION,
        STARTUPINFOW,
    };
    use windows::Win32::UI::WindowsAndMessaging::{MessageBoxW, MB_ICONERROR};

    fn wide(s: impl AsRef<std::ffi::OsStr>) -> Vec<u16> {
        s.as_ref().encode_wide().chain(Some(0)).collect()
    }

    /// A handle that is closed when dropped.
    struct Owned(HANDLE);

    impl Drop for Owned {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// The running game.
    pub struct Child {
        process: Owned,
        thread: Owned,
    }

    impl Child {
        /// Creates the game process with its main thread suspended.
        pub fn spawn_suspended(target: &Path, command_line: &str) -> Result<Child> {
            let application = wide(target);
            let mut command_line = wide(command_line);

            let startup = STARTUPINFOW {
                cb: std::mem::size_of::<STARTUPINFOW>() as u32,
                ..Default::default()
            };

            let mut info = PROCESS_INFORMATION::default();

            unsafe {
                CreateProcessW(
                    PCWSTR(application.as_ptr()),
                    PWSTR(command_line.as_mut_ptr()),
                    None,
                    None,
                    BOOL::from(true),
                    CREATE_SUSPENDED,
                    None,
                    PCWSTR::null(),
                    &startup,
                    &mut info,
                )
                .wrap_err_with(|| format!("CreateProcessW failed for {}", target.display()))?;
            }

            log::debug!("created process {} (suspended)", info.dwProcessId);

            Ok(Child {
                process: Owned(info.hProcess),
                thread: Owned(info.hThread),
            })
        }

        /// Loads the library at `payload` into the child by running `LoadLibraryW` on a remote
        /// thread, and waits for it (and so the payload's initialisation) to finish.
        pub fn load_library(&self, payload: &Path) -> Result<()> {
            let path = wide(payload);
            let bytes = path.len() * std::mem::size_of::<u16>();
            let process = self.process.0;

            unsafe {
                // kernel32 is mapped at the same address in every process of the same bitness.
                let kernel32 = GetModuleHandleW(w!("kernel32.dll"))?;
                let load_library = GetProcAddress(kernel32, s!("LoadLibraryW"))
                    .ok_or_else(|| eyre!("LoadLibraryW not found"))?;

                let start: unsafe extern "system" fn(*mut c_void) -> u32 =
                    std::mem::transmute(load_library);

                let remote = VirtualAllocEx(
                    process,
                    None,
                    bytes,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                );

                if remote.is_null() {
                    return Err(eyre!(
                        "unable to allocate memory in the game: {}",
                        windows::core::Error::from_win32()
                    ));
                }

                let result = (|| -> Result<()> {
                    WriteProcessMemory(process, remote, path.as_ptr().cast(), bytes, None)
                        .wrap_err("unable to write the payload path")?;

                    let thread = Owned(
                        CreateRemoteThread(
                            process,
                            None,
                            0,
                            Some(start),
                            Some(remote as *const c_void),
                            0,
                            None,
                        )
                        .wrap_err("unable to start the loader thread")?,
                    );

                    let _ = WaitForSingleObject(thread.0, INFINITE);

                    let mut module = 0u32;
                    GetExitCodeThread(thread.0, &mut module)?;

                    // The exit code is the low half of the module handle, which is never zero
                    //  for a loaded module.
                    if module == 0 {
                        return Err(eyre!("LoadLibraryW failed for {}", payload.display()));
                    }

                    Ok(())
                })();

                let _ = VirtualFreeEx(process, remote, 0, MEM_RELEASE);
                result
            }
        }

        pub fn resume(&self) -> Result<()> {
            if unsafe { ResumeThread(self.thread.0) } == u32::MAX {
                return Err(eyre!(
                    "unable to resume the game: {}",
                    windows::core::Error::from_win32()
                ));
            }

            Ok(())
        }

        pub fn kill(&self) {
            unsafe {
                let _ = TerminateProcess(self.process.0, 1);
            }
        }

        /// Blocks until the game exits and returns its exit code.
        pub fn wait(&self) -> Result<u32> {
            let mut code = 0u32;

            unsafe {
                let _ = WaitForSingleObject(self.process.0, INFINITE);
                GetExitCodeProcess(self.process.0, &mut code)
                    .wrap_err("unable to get the game's exit code")?;
            }

            Ok(code)
        }
    }

    pub fn error_box(title: &str, text: &str) {
        let title = wide(title);
        let text = wide(text);

        unsafe {
            let _ = MessageBoxW(
                HWND::default(),
                PCWSTR(text.as_ptr()),
                PCWSTR(title.as_ptr()),
                MB_ICONERROR,
            );
        }
    }
}

#[cfg(windows)]
pub use imp::{error_box, Child};

/// Starts `target` with `payload` loaded and running before the game's own code.
#[cfg(windows)]
pub fn launch(
    target: &std::path::Path,
    command_line: &str,
    payload: &std::path::Path,
) -> eyre::Result<Child> {
    log::info!(
        "Starting {} with {} ...",
        target.display(),
        payload.display()
    );

    let child = Child::spawn_suspended(target, command_line)?;

    if let Err(err) = child.load_library(payload).and_then(|_| child.resume()) {
        child.kill();
        return Err(err);
    }

    log::info!("Game started.");
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_arguments_are_untouched() {
        assert_eq!(quote_arg("--no-intro"), "--no-intro");
        assert_eq!(quote_arg(r"C:\Games\save.dat"), r"C:\Games\save.dat");
    }

    #[test]
    fn awkward_arguments_are_quoted() {
        assert_eq!(quote_arg(""), r#""""#);
        assert_eq!(quote_arg("two words"), r#""two words""#);
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg(r"C:\Program Files\"), r#""C:\Program Files\\""#);
        assert_eq!(quote_arg(r#"a\"b"#), r#""a\\\"b""#);
    }

    #[test]
    fn command_line_starts_with_program() {
        let line = build_command_line(OsStr::new("NecroDancer.exe"), ["--seed", "1 2"]);
        assert_eq!(line, r#"NecroDancer.exe --seed "1 2""#);

        let line = build_command_line(
            OsStr::new(r"C:\Crypt of the NecroDancer\NecroDancer.exe"),
            Vec::<String>::new(),
        );
        assert_eq!(line, r#""C:\Crypt of the NecroDancer\NecroDancer.exe""#);
    }
}
