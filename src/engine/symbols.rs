// This module resolves the runtime-support symbols a loaded module may call. Resolution
// happens once per engine and produces an owned table the engine reuses for every module.
// Core allocation, refcount, token and parallel-for entry points are taken from the
// caller's symbol map first and from the running process second. The tapir target adds a
// group of backend entry points that live in support libraries: a library that cannot be
// opened only produces a warning, but a symbol missing after its library was opened is an
// error. Core symbols that cannot be found are recorded as missing; they only become an
// error when a module actually declares them. The resolver never aborts on its own, the
// engine decides what an error means.

//! Runtime-support symbol table.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use log::{debug, warn};

use super::config::TapirTarget;
use crate::core::error::{EngineError, EngineResult};
use crate::lowering::parallel::PARALLEL_FOR;
use crate::lowering::to_low_level::{
    ALLOC_FN, ALLOC_MEMINFO_FN, CALL_DTOR_FN, CREATE_TOKEN_FN, DESTROY_TOKEN_FN,
};

/// Entry points every lowered module may call.
pub const CORE_SYMBOLS: [&str; 6] = [
    ALLOC_FN,
    CALL_DTOR_FN,
    ALLOC_MEMINFO_FN,
    CREATE_TOKEN_FN,
    DESTROY_TOKEN_FN,
    PARALLEL_FOR,
];

/// Resolved runtime symbols, name to address.
#[derive(Debug, Default, Clone)]
pub struct RuntimeSymbols {
    resolved: HashMap<String, usize>,
    missing: Vec<String>,
}

impl RuntimeSymbols {
    pub fn resolve(
        symbol_map: &HashMap<String, usize>,
        target: TapirTarget,
        libraries: &[PathBuf],
    ) -> EngineResult<Self> {
        let mut table = Self::default();
        load_process();
        for name in CORE_SYMBOLS {
            match symbol_map.get(name).copied().or_else(|| process_symbol(name)) {
                Some(addr) => {
                    table.resolved.insert(name.to_string(), addr);
                }
                None => table.missing.push(name.to_string()),
            }
        }

        let group = target.runtime_symbols();
        if group.is_empty() {
            return Ok(table);
        }
        let opened: Vec<&PathBuf> = libraries.iter().filter(|lib| load_library(lib)).collect();
        if opened.is_empty() {
            warn!("no {} support library could be opened ({:?})", target, libraries);
            table.missing.extend(group.iter().map(|s| s.to_string()));
            return Ok(table);
        }
        for name in group {
            match symbol_map.get(*name).copied().or_else(|| process_symbol(name)) {
                Some(addr) => {
                    table.resolved.insert(name.to_string(), addr);
                }
                None => {
                    return Err(EngineError::MissingRuntimeSymbol {
                        symbol: name.to_string(),
                        library: opened
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(":"),
                    });
                }
            }
        }
        debug!("resolved {} runtime symbols for {}", table.resolved.len(), target);
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.resolved.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.resolved.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_missing(&self, name: &str) -> bool {
        self.missing.iter().any(|m| m == name)
    }

    /// Fail on the first declared name that is a runtime symbol nobody provides.
    pub fn check_declared<'a>(
        &self,
        declared: impl IntoIterator<Item = &'a str>,
        symbol_map: &HashMap<String, usize>,
    ) -> EngineResult<()> {
        for name in declared {
            if self.is_missing(name) && !symbol_map.contains_key(name) {
                return Err(EngineError::MissingRuntimeSymbol {
                    symbol: name.to_string(),
                    library: "process".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn load_process() {
    // SAFETY: a null path makes the process image searchable.
    unsafe {
        llvm_sys::support::LLVMLoadLibraryPermanently(std::ptr::null());
    }
}

fn load_library(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.to_string_lossy().as_bytes()) else {
        return false;
    };
    // SAFETY: the path is a valid NUL-terminated string.
    let failed = unsafe { llvm_sys::support::LLVMLoadLibraryPermanently(cpath.as_ptr()) };
    if failed != 0 {
        warn!("could not open support library {}", path.display());
    }
    failed == 0
}

fn process_symbol(name: &str) -> Option<usize> {
    let cname = CString::new(name).ok()?;
    // SAFETY: only reads the loaded libraries' symbol tables.
    let addr = unsafe { llvm_sys::support::LLVMSearchForAddressOfSymbol(cname.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}
