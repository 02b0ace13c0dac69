//! The Lua environment that mods run in. We only set it up; everything else, including how the
//! mods are loaded, is up to the bootstrap script.

use eyre::{eyre, Result, WrapErr};
use mlua::{Function, Lua, LuaOptions, StdLib, Table, Value};
use std::path::{Path, PathBuf};

use crate::meta::resources::{self, Mod};

/// Runs `func(arg)` with a traceback appended to any error.
const PROTECTED_CALL: &str = r#"
local func, arg = ...
return xpcall(function() return func(arg) end, debug.traceback)
"#;

pub struct Runtime {
    lua: Lua,
    name: String,
}

impl Runtime {
    /// Opens a Lua state with every standard library (including `ffi` and `jit`, which scripts
    /// need to talk to the game) and points `require` at `script_root`.
    pub fn new(name: &str, script_root: &Path) -> Result<Runtime> {
        // `ffi` is only available through the unsafe constructor.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL, LuaOptions::default()) };

        let runtime = Runtime {
            lua,
            name: name.to_string(),
        };

        runtime.setup_globals(script_root)?;
        Ok(runtime)
    }

    fn setup_globals(&self, script_root: &Path) -> Result<()> {
        let globals = self.lua.globals();
        globals.set("_DLLNAME", self.name.as_str())?;

        let package: Table = globals.get("package")?;
        let path: String = package.get("path")?;
        let root = script_root.display();

        package.set("path", format!("{root}/?.lua;{root}/?/init.lua;{path}"))?;

        let native = self.lua.create_table()?;

        native.set(
            "getmods",
            self.lua.create_function(|lua, dir: String| {
                let inits = resources::find_mods(Path::new(&dir))
                    .into_iter()
                    .map(|found| found.init.to_string_lossy().into_owned());

                lua.create_sequence_from(inits)
            })?,
        )?;

        native.set(
            "address_of",
            self.lua
                .create_function(|_, name: String| Ok(crate::host::address_of(&name)))?,
        )?;

        globals.set("_NATIVE", native)?;
        Ok(())
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    fn protected_call<'lua>(
        &'lua self,
        func: Function<'lua>,
        arg: Value<'lua>,
    ) -> Result<Value<'lua>> {
        let wrapper = self
            .lua
            .load(PROTECTED_CALL)
            .set_name("=protected_call")
            .into_function()?;

        let (ok, value): (bool, Value) = wrapper.call((func, arg))?;

        if ok {
            return Ok(value);
        }

        let message = match &value {
            Value::String(s) => s.to_string_lossy().into_owned(),
            other => format!("{:?}", other),
        };

        Err(eyre!("{}", message))
    }

    /// Requires `<name>.init` and publishes the module it returns as the global `necrolua`.
    pub fn bootstrap(&self) -> Result<()> {
        let module_name = format!("{}.init", self.name);
        log::info!("Initializing the Lua API ({}) ...", module_name);

        let require: Function = self.lua.globals().get("require")?;
        let module = self
            .protected_call(require, Value::String(self.lua.create_string(&module_name)?))
            .wrap_err_with(|| format!("failed to load {}", module_name))?;

        self.lua.globals().set("necrolua", module)?;
        Ok(())
    }

    /// Hands the entry points of `mods` to `necrolua.reload`.
    pub fn reload_mods(&self, mods: &[Mod]) -> Result<()> {
        log::info!("(Re)loading {} mod(s) ...", mods.len());

        let api: Table = self
            .lua
            .globals()
            .get("necrolua")
            .wrap_err("the bootstrap script did not return a table")?;

        let reload: Function = api
            .get("reload")
            .wrap_err("the bootstrap script has no `reload` function")?;

        let inits = mods
            .iter()
            .map(|found| found.init.to_string_lossy().into_owned());

        let list = self.lua.create_sequence_from(inits)?;

        self.protected_call(reload, Value::Table(list))
            .wrap_err("failed to reload mods")?;

        Ok(())
    }
}

/// Where `require` looks first for `<name>/init.lua`.
pub fn script_root(configured: &Path) -> PathBuf {
    resources::get_game_path(configured)
}
