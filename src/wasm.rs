//! Running sandboxed WebAssembly handlers.
//!
//! A WebAssembly handler is a compiled module below the exec root. The
//! module is compiled once and cached per worker process, keyed by path
//! and validated against the file’s modification time. Every request gets
//! a fresh store and instance, so no state leaks between requests and a
//! misbehaving module can only ruin its own request.
//!
//! The module ABI is narrow: an exported linear `memory`, an exported
//! `alloc(len: u32) -> u32`, an optional `dealloc(ptr: u32, len: u32)`,
//! and `handle_request(ptr: u32, len: u32) -> u64` returning the response
//! location packed as `(ptr << 32) | len`. Pointers and lengths are
//! unsigned; the low 32 bits are never sign-extended.

use std::{fmt, fs, io};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use log::debug;
use wasmtime::{Engine, Instance, Memory, Module, Store, TypedFunc};

/// The number of slots in the per-worker module cache.
///
/// A full cache silently stops caching new modules rather than evicting:
/// the set of handlers on a server is expected to be small and stable.
const MODULE_CACHE_SLOTS: usize = 128;


//------------ ModuleCache ---------------------------------------------------

/// A per-worker cache of compiled modules.
///
/// Workers are single-threaded on the request path, so the cache needs no
/// locking; each worker process owns its own copy.
pub struct ModuleCache {
    /// The engine all modules are compiled for.
    engine: Engine,

    /// The cached modules, at most one entry per source path.
    entries: Vec<CacheEntry>,

    /// How many times we have compiled a module.
    compiles: u64,
}

/// A single cached module.
struct CacheEntry {
    /// The path the module was compiled from.
    path: PathBuf,

    /// The modification time observed at compile time.
    mtime: SystemTime,

    /// The compiled module.
    module: Module,
}

impl ModuleCache {
    /// Creates a new, empty cache with a default engine.
    pub fn new() -> Self {
        ModuleCache {
            engine: Engine::default(),
            entries: Vec::new(),
            compiles: 0,
        }
    }

    /// Returns the number of module compilations so far.
    pub fn compile_count(&self) -> u64 {
        self.compiles
    }

    /// Returns the compiled module for the file at the given path.
    ///
    /// Reuses the cached module if the file’s modification time hasn’t
    /// changed since it was compiled; otherwise drops the stale module
    /// and recompiles.
    fn load(&mut self, path: &Path) -> Result<Module, WasmError> {
        let mtime = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(WasmError::Io)?;

        if let Some(pos) = self.entries.iter().position(|entry| {
            entry.path == path
        }) {
            if self.entries[pos].mtime == mtime {
                return Ok(self.entries[pos].module.clone())
            }
            // File changed: drop the stale module before recompiling.
            self.entries.remove(pos);
        }

        let bytes = fs::read(path).map_err(WasmError::Io)?;
        let module = Module::new(&self.engine, &bytes)
            .map_err(WasmError::Compile)?;
        self.compiles += 1;
        if self.entries.len() < MODULE_CACHE_SLOTS {
            self.entries.push(CacheEntry {
                path: path.into(),
                mtime,
                module: module.clone(),
            });
        }
        else {
            debug!("module cache full, not caching {}", path.display());
        }
        Ok(module)
    }

    /// Runs the module at the given path on a request.
    ///
    /// Returns the raw response bytes produced by the module. Any
    /// failure – compile, instantiate, missing export, guest trap, or an
    /// out-of-bounds result region – is a single opaque execution error;
    /// the caller answers with a 500 and moves on.
    pub fn execute(
        &mut self, path: &Path, request: &[u8]
    ) -> Result<Vec<u8>, WasmError> {
        let module = self.load(path)?;

        // A fresh store per invocation keeps requests isolated.
        let mut store = Store::new(&self.engine, ());
        let instance = Instance::new(&mut store, &module, &[])
            .map_err(WasmError::Execution)?;
        let exports = RequiredExports::resolve(&mut store, &instance)?;

        let req_len = u32::try_from(request.len())
            .map_err(|_| WasmError::OutOfBounds)?;
        let req_ptr = exports.alloc.call(&mut store, req_len)
            .map_err(WasmError::Execution)?;

        let mem_size = exports.memory.data_size(&store) as u64;
        if u64::from(req_ptr) + u64::from(req_len) > mem_size {
            return Err(WasmError::OutOfBounds)
        }
        exports.memory.write(&mut store, req_ptr as usize, request)
            .map_err(|_| WasmError::OutOfBounds)?;

        let packed = exports.handle_request
            .call(&mut store, (req_ptr, req_len))
            .map_err(WasmError::Execution)?;
        let res_ptr = (packed >> 32) as u32;
        let res_len = packed as u32;

        let mem_size = exports.memory.data_size(&store) as u64;
        if u64::from(res_ptr) + u64::from(res_len) > mem_size {
            return Err(WasmError::OutOfBounds)
        }
        let mut response = vec![0u8; res_len as usize];
        exports.memory.read(&store, res_ptr as usize, &mut response)
            .map_err(|_| WasmError::OutOfBounds)?;

        if let Some(dealloc) = exports.dealloc {
            if let Err(err) = dealloc.call(
                &mut store, (res_ptr, res_len)
            ) {
                debug!("dealloc failed in {}: {}", path.display(), err);
            }
        }
        Ok(response)
    }
}


//------------ RequiredExports -----------------------------------------------

/// The exports the module ABI requires.
struct RequiredExports {
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    dealloc: Option<TypedFunc<(u32, u32), ()>>,
    handle_request: TypedFunc<(u32, u32), u64>,
}

impl RequiredExports {
    /// Resolves the exports from an instance.
    ///
    /// Anything missing except `dealloc` is a hard failure.
    fn resolve(
        store: &mut Store<()>, instance: &Instance
    ) -> Result<Self, WasmError> {
        let memory = instance.get_memory(&mut *store, "memory")
            .ok_or(WasmError::MissingExport("memory"))?;
        let alloc = instance
            .get_typed_func::<u32, u32>(&mut *store, "alloc")
            .map_err(|_| WasmError::MissingExport("alloc"))?;
        let dealloc = instance
            .get_typed_func::<(u32, u32), ()>(&mut *store, "dealloc")
            .ok();
        let handle_request = instance
            .get_typed_func::<(u32, u32), u64>(&mut *store, "handle_request")
            .map_err(|_| WasmError::MissingExport("handle_request"))?;
        Ok(RequiredExports { memory, alloc, dealloc, handle_request })
    }
}


//------------ WasmError -----------------------------------------------------

/// Executing a WebAssembly handler has failed.
#[derive(Debug)]
pub enum WasmError {
    /// Reading the module file failed.
    Io(io::Error),

    /// The module file didn’t compile.
    Compile(wasmtime::Error),

    /// A required export is missing or has the wrong type.
    MissingExport(&'static str),

    /// Instantiation failed or the guest trapped.
    Execution(wasmtime::Error),

    /// The guest handed us a region outside its own memory.
    OutOfBounds,
}

impl fmt::Display for WasmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            WasmError::Io(ref err) => {
                write!(f, "cannot read module: {}", err)
            }
            WasmError::Compile(ref err) => {
                write!(f, "module failed to compile: {}", err)
            }
            WasmError::MissingExport(name) => {
                write!(f, "module is missing export '{}'", name)
            }
            WasmError::Execution(ref err) => {
                write!(f, "module execution failed: {}", err)
            }
            WasmError::OutOfBounds => {
                f.write_str("module returned out-of-bounds region")
            }
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// A module that echoes the request region back as the response.
    const ECHO_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (func (export "alloc") (param i32) (result i32)
            (local $ptr i32)
            global.get $heap
            local.set $ptr
            global.get $heap
            local.get 0
            i32.add
            global.set $heap
            local.get $ptr)
          (func (export "handle_request") (param i32 i32) (result i64)
            local.get 0
            i64.extend_i32_u
            i64.const 32
            i64.shl
            local.get 1
            i64.extend_i32_u
            i64.or))
    "#;

    /// A module that claims its response lives past the end of memory.
    const OUT_OF_BOUNDS_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "alloc") (param i32) (result i32)
            i32.const 1024)
          (func (export "handle_request") (param i32 i32) (result i64)
            i64.const 0x11000_00000028))
    "#;

    /// A module without the request entry point.
    const INCOMPLETE_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "alloc") (param i32) (result i32)
            i32.const 1024))
    "#;

    /// A module that traps on every request.
    const TRAPPING_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "alloc") (param i32) (result i32)
            i32.const 1024)
          (func (export "handle_request") (param i32 i32) (result i64)
            unreachable))
    "#;

    fn write_module(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn echo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "echo.wasm", ECHO_MODULE);
        let mut cache = ModuleCache::new();
        let res = cache.execute(&path, b"fresh pot").unwrap();
        assert_eq!(res, b"fresh pot");
    }

    #[test]
    fn cache_reuses_unchanged_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "echo.wasm", ECHO_MODULE);
        let mut cache = ModuleCache::new();
        cache.execute(&path, b"one").unwrap();
        cache.execute(&path, b"two").unwrap();
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn touched_module_recompiles_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "echo.wasm", ECHO_MODULE);
        let mut cache = ModuleCache::new();
        cache.execute(&path, b"one").unwrap();
        // Make sure the rewrite lands on a different mtime.
        thread::sleep(Duration::from_millis(20));
        fs::write(&path, ECHO_MODULE).unwrap();
        cache.execute(&path, b"two").unwrap();
        cache.execute(&path, b"three").unwrap();
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn out_of_bounds_result_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(
            dir.path(), "oob.wasm", OUT_OF_BOUNDS_MODULE
        );
        let mut cache = ModuleCache::new();
        assert!(matches!(
            cache.execute(&path, b"x"),
            Err(WasmError::OutOfBounds)
        ));
    }

    #[test]
    fn missing_export_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(
            dir.path(), "incomplete.wasm", INCOMPLETE_MODULE
        );
        let mut cache = ModuleCache::new();
        assert!(matches!(
            cache.execute(&path, b"x"),
            Err(WasmError::MissingExport("handle_request"))
        ));
    }

    #[test]
    fn trapping_module_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "trap.wasm", TRAPPING_MODULE);
        let mut cache = ModuleCache::new();
        assert!(matches!(
            cache.execute(&path, b"x"),
            Err(WasmError::Execution(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let mut cache = ModuleCache::new();
        assert!(matches!(
            cache.execute(Path::new("/nonexistent.wasm"), b"x"),
            Err(WasmError::Io(_))
        ));
    }
}
