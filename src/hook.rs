//! Keeps track of the function hooks installed in the game, and exports the functions that
//! scripts use (through the LuaJIT FFI) to install and remove them.

use lazy_static::lazy_static;
use retour::RawDetour;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::Mutex;

// Win32 error codes returned to scripts. Scripts compare against these directly.
const NO_ERROR: i32 = 0;
const ERROR_INVALID_HANDLE: i32 = 6;
const ERROR_NOT_ENOUGH_MEMORY: i32 = 8;
const ERROR_INVALID_BLOCK: i32 = 9;
const ERROR_INVALID_OPERATION: i32 = 4317;

#[derive(Debug)]
pub enum HookError {
    /// The target or the detour was a null pointer.
    NullPointer,

    /// The target already has a hook installed.
    AlreadyAttached(usize),

    /// Nothing is attached at the given address.
    NotAttached(usize),

    /// A detach was requested with a detour other than the one that was attached.
    DetourMismatch { expected: usize, found: usize },

    /// Memory for the trampoline could not be allocated.
    OutOfMemory,

    /// The target could not be patched, usually because the function is too short or starts
    /// with an instruction that can't be relocated.
    Unpatchable(String),
}

impl HookError {
    /// The Win32 error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            HookError::NullPointer => ERROR_INVALID_HANDLE,
            HookError::AlreadyAttached(_)
            | HookError::NotAttached(_)
            | HookError::DetourMismatch { .. } => ERROR_INVALID_OPERATION,
            HookError::OutOfMemory => ERROR_NOT_ENOUGH_MEMORY,
            HookError::Unpatchable(_) => ERROR_INVALID_BLOCK,
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::NullPointer => write!(f, "null target or detour"),
            HookError::AlreadyAttached(addr) => write!(f, "{:#x} is already hooked", addr),
            HookError::NotAttached(addr) => write!(f, "no hook is attached at {:#x}", addr),
            HookError::DetourMismatch { expected, found } => write!(
                f,
                "hook was attached with detour {:#x}, not {:#x}",
                expected, found
            ),
            HookError::OutOfMemory => write!(f, "out of memory for trampoline"),
            HookError::Unpatchable(reason) => write!(f, "unable to patch target: {}", reason),
        }
    }
}

impl std::error::Error for HookError {}

impl From<retour::Error> for HookError {
    fn from(err: retour::Error) -> Self {
        match err {
            retour::Error::OutOfMemory => HookError::OutOfMemory,
            other => HookError::Unpatchable(other.to_string()),
        }
    }
}

struct Hook {
    detour: usize,
    raw: RawDetour,
}

impl Hook {
    fn trampoline(&self) -> usize {
        self.raw.trampoline() as *const () as usize
    }
}

/// All of the hooks that are currently installed, keyed by the address of the hooked function.
#[derive(Default)]
pub struct HookTable {
    hooks: HashMap<usize, Hook>,
}

impl HookTable {
    pub fn new() -> HookTable {
        HookTable::default()
    }

    /// Redirects `target` to `detour`, returning a trampoline that runs the original
    /// implementation.
    ///
    /// # Safety
    /// Both pointers must point to functions with the same signature and calling convention,
    /// and no thread may be executing the first few instructions of `target` during the call.
    pub unsafe fn attach(
        &mut self,
        target: *const (),
        detour: *const (),
    ) -> Result<*const (), HookError> {
        if target.is_null() || detour.is_null() {
            return Err(HookError::NullPointer);
        }

        let key = target as usize;

        if self.hooks.contains_key(&key) {
            return Err(HookError::AlreadyAttached(key));
        }

        let raw = RawDetour::new(target, detour)?;
        raw.enable()?;

        let hook = Hook {
            detour: detour as usize,
            raw,
        };

        let trampoline = hook.trampoline();
        self.hooks.insert(key, hook);

        log::debug!(
            "hooked {:#x} -> {:#x} (trampoline {:#x})",
            key,
            detour as usize,
            trampoline
        );

        Ok(trampoline as *const ())
    }

    /// Removes the hook identified by `pointer`, which may be either the trampoline returned by
    /// `attach` or the original target. Returns the original target.
    ///
    /// # Safety
    /// No thread may be executing the patched instructions of the target during the call, and
    /// the trampoline must not be called after this returns.
    pub unsafe fn detach(
        &mut self,
        pointer: *const (),
        detour: *const (),
    ) -> Result<*const (), HookError> {
        if pointer.is_null() || detour.is_null() {
            return Err(HookError::NullPointer);
        }

        let pointer = pointer as usize;

        let key = if self.hooks.contains_key(&pointer) {
            pointer
        } else {
            self.hooks
                .iter()
                .find(|(_, hook)| hook.trampoline() == pointer)
                .map(|(&target, _)| target)
                .ok_or(HookError::NotAttached(pointer))?
        };

        let hook = &self.hooks[&key];

        if hook.detour != detour as usize {
            return Err(HookError::DetourMismatch {
                expected: hook.detour,
                found: detour as usize,
            });
        }

        hook.raw.disable()?;
        self.hooks.remove(&key);

        log::debug!("unhooked {:#x}", key);

        Ok(key as *const ())
    }

    pub fn is_hooked(&self, target: *const ()) -> bool {
        self.hooks.contains_key(&(target as usize))
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

lazy_static! {
    // Holding the lock is what makes an attach or detach a single transaction.
    static ref HOOKS: Mutex<HookTable> = Mutex::new(HookTable::new());
}

fn with_table<T>(func: impl FnOnce(&mut HookTable) -> T) -> T {
    let mut table = match HOOKS.lock() {
        Ok(table) => table,
        Err(poisoned) => poisoned.into_inner(),
    };

    func(&mut table)
}

/// Attaches `detour` to the function that `*pointer` points to, replacing `*pointer` with the
/// trampoline on success.
///
/// # Safety
/// `pointer` must be valid for reads and writes. See `HookTable::attach`.
pub unsafe fn attach(pointer: *mut *mut c_void, detour: *mut c_void) -> Result<(), HookError> {
    if pointer.is_null() {
        return Err(HookError::NullPointer);
    }

    let trampoline = with_table(|table| table.attach(*pointer as *const (), detour as *const ()))?;
    *pointer = trampoline as *mut c_void;

    Ok(())
}

/// Detaches `detour` from the hook whose trampoline is in `*pointer`, restoring `*pointer` to
/// the original function on success.
///
/// # Safety
/// `pointer` must be valid for reads and writes. See `HookTable::detach`.
pub unsafe fn detach(pointer: *mut *mut c_void, detour: *mut c_void) -> Result<(), HookError> {
    if pointer.is_null() {
        return Err(HookError::NullPointer);
    }

    let target = with_table(|table| table.detach(*pointer as *const (), detour as *const ()))?;
    *pointer = target as *mut c_void;

    Ok(())
}

fn to_code(result: Result<(), HookError>) -> i32 {
    match result {
        Ok(()) => NO_ERROR,
        Err(err) => {
            log::warn!("{}", err);
            err.code()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn nl_attach(pointer: *mut *mut c_void, detour: *mut c_void) -> i32 {
    to_code(attach(pointer, detour))
}

#[no_mangle]
pub unsafe extern "C" fn nl_detach(pointer: *mut *mut c_void, detour: *mut c_void) -> i32 {
    to_code(detach(pointer, detour))
}

/// The calling thread's last OS error. LuaJIT clobbers it between an FFI call returning and
/// the script reading `GetLastError`, so scripts ask us instead.
#[no_mangle]
pub extern "C" fn nl_last_error() -> u32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or_default() as u32
}

pub fn generate_backtrace() -> String {
    // Addresses are more useful relative to the game's base because that's what the PDB uses.
    let resolved = backtrace::Backtrace::new();
    let base = crate::host::base_of_dll();

    let mut lines = vec![format!("Game module base is {:#x}.", base)];

    for (i, frame) in resolved.frames().iter().enumerate() {
        let address = frame.symbol_address() as u64;

        lines.push(format!(
            "{}: {:#x} (base + {:#x})\n  symbols: {:?}",
            i,
            address,
            address.wrapping_sub(base),
            frame.symbols()
        ));
    }

    lines.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_win32() {
        assert_eq!(HookError::NullPointer.code(), 6);
        assert_eq!(HookError::OutOfMemory.code(), 8);
        assert_eq!(HookError::Unpatchable("short".into()).code(), 9);
        assert_eq!(HookError::NotAttached(0x1000).code(), 4317);
        assert_eq!(
            HookError::DetourMismatch {
                expected: 1,
                found: 2
            }
            .code(),
            4317
        );
    }

    #[test]
    fn null_pointers_are_rejected() {
        let mut table = HookTable::new();

        unsafe {
            assert!(matches!(
                table.attach(std::ptr::null(), std::ptr::null()),
                Err(HookError::NullPointer)
            ));

            assert_eq!(nl_attach(std::ptr::null_mut(), std::ptr::null_mut()), 6);
            assert_eq!(nl_detach(std::ptr::null_mut(), std::ptr::null_mut()), 6);
        }

        assert!(table.is_empty());
    }

    #[test]
    fn detaching_unknown_pointer_fails() {
        let mut table = HookTable::new();
        let fake = 0x1234 as *const ();

        let err = unsafe { table.detach(fake, fake) }.unwrap_err();
        assert!(matches!(err, HookError::NotAttached(0x1234)));
        assert_eq!(err.code(), 4317);
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    mod live {
        use super::super::*;
        use std::ffi::c_void;

        #[inline(never)]
        extern "C" fn add(x: i32, y: i32) -> i32 {
            unsafe { std::ptr::read_volatile(&x as *const i32) + y }
        }

        #[inline(never)]
        extern "C" fn sub_detour(x: i32, y: i32) -> i32 {
            unsafe { std::ptr::read_volatile(&x as *const i32) - y }
        }

        type BinOp = extern "C" fn(i32, i32) -> i32;

        fn call(func: BinOp, x: i32, y: i32) -> i32 {
            std::hint::black_box(func)(x, y)
        }

        #[test]
        fn attach_and_detach_round() {
            let mut table = HookTable::new();
            let target = add as BinOp as *const ();
            let detour = sub_detour as BinOp as *const ();

            assert_eq!(call(add, 10, 5), 15);

            let trampoline = unsafe { table.attach(target, detour) }.expect("attach");
            assert!(table.is_hooked(target));
            assert_eq!(call(add, 10, 5), 5);

            let original: BinOp = unsafe { std::mem::transmute(trampoline) };
            assert_eq!(call(original, 10, 5), 15);

            assert!(matches!(
                unsafe { table.attach(target, detour) },
                Err(HookError::AlreadyAttached(_))
            ));

            assert!(matches!(
                unsafe { table.detach(trampoline, target) },
                Err(HookError::DetourMismatch { .. })
            ));

            let restored = unsafe { table.detach(trampoline, detour) }.expect("detach");
            assert_eq!(restored, target);
            assert!(table.is_empty());
            assert_eq!(call(add, 10, 5), 15);
        }

        #[inline(never)]
        extern "C" fn mul(x: i32, y: i32) -> i32 {
            unsafe { std::ptr::read_volatile(&x as *const i32) * y }
        }

        #[inline(never)]
        extern "C" fn neg_detour(x: i32, y: i32) -> i32 {
            -unsafe { std::ptr::read_volatile(&x as *const i32) * y }
        }

        #[test]
        fn exported_functions_rewrite_pointer() {
            let target = mul as BinOp as *mut c_void;
            let detour = neg_detour as BinOp as *mut c_void;
            let mut pointer = target;

            // Attaching swaps the caller's pointer for the trampoline.
            assert_eq!(unsafe { nl_attach(&mut pointer, detour) }, 0);
            assert_ne!(pointer, target);
            assert_eq!(call(mul, 3, 4), -12);

            let original: BinOp = unsafe { std::mem::transmute(pointer) };
            assert_eq!(call(original, 3, 4), 12);

            // Detaching by the original target restores it too.
            let mut by_target = target;
            assert_eq!(unsafe { nl_detach(&mut by_target, detour) }, 0);
            assert_eq!(by_target, target);
            assert_eq!(call(mul, 3, 4), 12);

            // The old trampoline is gone with the hook.
            assert_eq!(unsafe { nl_detach(&mut pointer, detour) }, 4317);

            // Hooking the same function again works once it has been detached.
            let mut pointer = target;
            assert_eq!(unsafe { nl_attach(&mut pointer, detour) }, 0);
            assert_eq!(call(mul, 3, 4), -12);

            assert_eq!(unsafe { nl_detach(&mut pointer, detour) }, 0);
            assert_eq!(pointer, target);
            assert_eq!(call(mul, 3, 4), 12);
        }
    }
}
