//! Lua execution engine.
//!
//! Each context owns one Lua 5.4 interpreter. Globals defined by one script
//! stay visible to later scripts run on the same context, which is what
//! makes a warm worker cheaper than a fresh interpreter per call.
//!
//! # Primitives
//!
//! ```lua
//! emit(1, "two", { three = 3 })   -- each argument becomes one result item
//! print("hello", 42)              -- one item: "hello\t42"
//! sleep(250)                      -- milliseconds, interruptible by cancel
//! return "done"                   -- returned values are emitted last
//! ```
//!
//! # Cancellation
//!
//! An instruction-count hook checks the run's [`StopSignal`] and raises a
//! Lua error when it fired; `sleep` polls the same signal. The run then
//! reports [`RunOutcome::Stopped`].
//!
//! `pcall`, `xpcall` and `coroutine.resume` are wrapped so a script cannot
//! swallow that error: once the signal fired they re-raise it on return.
//! A script that finishes on its own is still reported as completed, even
//! when the signal fired during its last few instructions.

use mlua::{Function, HookTriggers, Lua, LuaSerdeExt, MultiValue, Table, Value, Variadic, VmState};

use super::{EngineFault, ExecutionContext, ItemSender, RunOutcome, ScriptEngine, StopSignal};
use crate::constants::{LUA_HOOK_INSTRUCTIONS, LUA_SLEEP_SLICE};

/// Error text raised inside Lua when a run is stopped.
const STOPPED_MESSAGE: &str = "script stopped by request";

/// Engine producing Lua-backed contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LuaEngine;

impl LuaEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for LuaEngine {
    type Context = LuaContext;

    fn create_context(&self) -> Result<LuaContext, EngineFault> {
        LuaContext::new().map_err(|e| EngineFault::Context(e.to_string()))
    }
}

/// A reusable Lua interpreter state.
pub struct LuaContext {
    lua: Lua,
    runs: u64,
}

impl std::fmt::Debug for LuaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaContext")
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}

impl LuaContext {
    /// Create a Lua state with the streaming primitives registered.
    pub fn new() -> mlua::Result<Self> {
        let lua = Lua::new();
        register_primitives(&lua)?;
        Ok(Self { lua, runs: 0 })
    }

    /// Number of scripts run on this context so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

impl ExecutionContext for LuaContext {
    fn run_streaming(
        &mut self,
        script: &str,
        items: &ItemSender,
        stop: &StopSignal,
    ) -> Result<RunOutcome, EngineFault> {
        self.runs += 1;
        if stop.is_fired() {
            return Ok(RunOutcome::Stopped);
        }

        self.lua.set_app_data(items.clone());
        self.lua.set_app_data(stop.clone());
        let hook_stop = stop.clone();
        self.lua.set_hook(
            HookTriggers::default().every_nth_instruction(LUA_HOOK_INSTRUCTIONS),
            move |_, _| {
                if hook_stop.is_fired() {
                    Err(mlua::Error::runtime(STOPPED_MESSAGE))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let result = self
            .lua
            .load(script)
            .set_name("script")
            .call::<MultiValue>(())
            .and_then(|returned| {
                for value in returned {
                    if !value.is_nil() {
                        emit_value(&self.lua, value)?;
                    }
                }
                Ok(())
            });

        self.lua.remove_hook();
        self.lua.remove_app_data::<ItemSender>();
        self.lua.remove_app_data::<StopSignal>();

        match result {
            Ok(()) => Ok(RunOutcome::Completed),
            Err(_) if stop.is_fired() => Ok(RunOutcome::Stopped),
            Err(e) => Err(EngineFault::Script(e.to_string())),
        }
    }
}

/// Register `emit`, `print` and `sleep` as globals and guard the
/// protected-call builtins.
fn register_primitives(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    let emit = lua.create_function(|lua, values: Variadic<Value>| {
        for value in values {
            emit_value(lua, value)?;
        }
        Ok(())
    })?;
    globals.set("emit", emit)?;

    // print(...) streams one item, tab-joined like the stock print.
    let print = lua.create_function(|lua, values: Variadic<Value>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut parts = Vec::with_capacity(values.len());
        for value in values {
            parts.push(tostring.call::<String>(value)?);
        }
        publish(lua, serde_json::Value::String(parts.join("\t")))
    })?;
    globals.set("print", print)?;

    let sleep = lua.create_function(|lua, millis: u64| {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(millis);
        loop {
            raise_if_stopped(lua)?;
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(LUA_SLEEP_SLICE.min(deadline - now));
        }
    })?;
    globals.set("sleep", sleep)?;

    let coroutine: Table = globals.get("coroutine")?;
    for (table, name) in [(&globals, "pcall"), (&globals, "xpcall"), (&coroutine, "resume")] {
        let original: Function = table.get(name)?;
        let guarded = lua.create_function(move |lua, args: MultiValue| {
            let returned = original.call::<MultiValue>(args)?;
            raise_if_stopped(lua)?;
            Ok(returned)
        })?;
        table.set(name, guarded)?;
    }

    Ok(())
}

fn raise_if_stopped(lua: &Lua) -> mlua::Result<()> {
    let fired = lua
        .app_data_ref::<StopSignal>()
        .is_some_and(|stop| stop.is_fired());
    if fired {
        Err(mlua::Error::runtime(STOPPED_MESSAGE))
    } else {
        Ok(())
    }
}

fn emit_value(lua: &Lua, value: Value) -> mlua::Result<()> {
    let item = lua_to_json(lua, value)?;
    publish(lua, item)
}

fn publish(lua: &Lua, item: serde_json::Value) -> mlua::Result<()> {
    let items = lua
        .app_data_ref::<ItemSender>()
        .ok_or_else(|| mlua::Error::runtime("emit called outside of a running script"))?;
    if items.emit(item) {
        Ok(())
    } else {
        Err(mlua::Error::runtime("output channel closed"))
    }
}

/// Convert a Lua value to JSON, falling back to `tostring` for values
/// serde cannot represent (functions, userdata, mixed tables).
fn lua_to_json(lua: &Lua, value: Value) -> mlua::Result<serde_json::Value> {
    match lua.from_value::<serde_json::Value>(value.clone()) {
        Ok(json) => Ok(json),
        Err(_) => {
            let tostring: Function = lua.globals().get("tostring")?;
            Ok(serde_json::Value::String(tostring.call::<String>(value)?))
        }
    }
}
