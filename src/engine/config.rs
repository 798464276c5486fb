// This module holds the execution engine configuration. `EngineOptions` is what a caller
// hands to the engine: optimization level, object caching, a static symbol table, the
// optional module transformers and assembly sink, and the task-parallel target together
// with the support libraries its runtime lives in. Fields left unset fall back to the
// environment (`ARRAYJIT_TAPIR_TARGET`, `ARRAYJIT_RUNTIME_LIBS`) and then to the target's
// defaults. `CompileConfig` is the read-only view of these options the compile stage
// receives, so compiling a module never needs access to the engine itself.

//! Engine options.

use std::fmt;
use std::path::PathBuf;

use hashbrown::HashMap;
use inkwell::module::Module as LlvmModule;

use crate::llvm::OptLevel;

/// Environment variable selecting the tapir target.
pub const TAPIR_TARGET_ENV: &str = "ARRAYJIT_TAPIR_TARGET";
/// Environment variable overriding the support library list (colon separated).
pub const RUNTIME_LIBS_ENV: &str = "ARRAYJIT_RUNTIME_LIBS";

/// Transformation applied to a translated LLVM module.
pub type ModuleTransformer = Box<dyn Fn(&LlvmModule<'_>) -> Result<(), String>>;
/// Receives the assembly text of every compiled module.
pub type AsmPrinter = Box<dyn Fn(&str)>;

/// Task-parallel backend the runtime ABI targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapirTarget {
    #[default]
    Serial,
    OpenCilk,
    Cuda,
}

impl TapirTarget {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "serial" => Some(TapirTarget::Serial),
            "opencilk" => Some(TapirTarget::OpenCilk),
            "cuda" => Some(TapirTarget::Cuda),
            _ => None,
        }
    }

    /// Target from the environment; unset or unknown values mean serial.
    pub fn from_env() -> Self {
        match std::env::var(TAPIR_TARGET_ENV) {
            Ok(value) => TapirTarget::parse(&value).unwrap_or_else(|| {
                log::warn!("unknown {} value {:?}, using serial", TAPIR_TARGET_ENV, value);
                TapirTarget::Serial
            }),
            Err(_) => TapirTarget::Serial,
        }
    }

    /// Value of `tapir.loop.target` loop metadata.
    pub fn id(self) -> i64 {
        match self {
            TapirTarget::Serial => 1,
            TapirTarget::Cuda => 4,
            TapirTarget::OpenCilk => 8,
        }
    }

    pub fn default_libraries(self) -> Vec<PathBuf> {
        match self {
            TapirTarget::Serial => Vec::new(),
            TapirTarget::OpenCilk => vec![PathBuf::from("libopencilk.so")],
            TapirTarget::Cuda => vec![PathBuf::from("libkitrt.so")],
        }
    }

    /// Entry points that must exist in an opened support library.
    pub fn runtime_symbols(self) -> &'static [&'static str] {
        match self {
            TapirTarget::Cuda => &[
                "__cudaRegisterFatBinary",
                "__cudaRegisterFatBinaryEnd",
                "__cudaUnregisterFatBinary",
                "__kitcuda_use_occupancy_launch",
                "__kitcuda_initialize",
                "__kitcuda_destroy",
                "__kitcuda_launch_kernel",
                "__kitcuda_mem_gpu_prefetch",
                "__kitcuda_set_default_threads_per_blk",
                "__kitcuda_sync_thread_stream",
                "__kitcuda_mem_alloc_managed_numba",
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for TapirTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapirTarget::Serial => write!(f, "serial"),
            TapirTarget::OpenCilk => write!(f, "opencilk"),
            TapirTarget::Cuda => write!(f, "cuda"),
        }
    }
}

/// Split a colon separated library list, skipping empty entries.
pub fn parse_library_list(value: &str) -> Vec<PathBuf> {
    value.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect()
}

pub struct EngineOptions {
    pub opt_level: OptLevel,
    pub enable_object_cache: bool,
    /// Extra symbols installed into the JIT of every loaded module, name to address.
    pub symbol_map: HashMap<String, usize>,
    /// Runs on the translated module when it is loaded.
    pub transformer: Option<ModuleTransformer>,
    /// Runs first in the compile stage.
    pub late_transformer: Option<ModuleTransformer>,
    pub asm_printer: Option<AsmPrinter>,
    /// `None` reads `ARRAYJIT_TAPIR_TARGET`.
    pub tapir_target: Option<TapirTarget>,
    /// `None` reads `ARRAYJIT_RUNTIME_LIBS`, then the target defaults.
    pub runtime_libraries: Option<Vec<PathBuf>>,
    /// Verify after each pass of the second optimization stage.
    pub verify: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Default,
            enable_object_cache: true,
            symbol_map: HashMap::new(),
            transformer: None,
            late_transformer: None,
            asm_printer: None,
            tapir_target: None,
            runtime_libraries: None,
            verify: cfg!(debug_assertions),
        }
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("opt_level", &self.opt_level)
            .field("enable_object_cache", &self.enable_object_cache)
            .field("symbols", &self.symbol_map.len())
            .field("transformer", &self.transformer.is_some())
            .field("late_transformer", &self.late_transformer.is_some())
            .field("asm_printer", &self.asm_printer.is_some())
            .field("tapir_target", &self.tapir_target)
            .field("runtime_libraries", &self.runtime_libraries)
            .finish()
    }
}

impl EngineOptions {
    pub fn tapir_target(&self) -> TapirTarget {
        self.tapir_target.unwrap_or_else(TapirTarget::from_env)
    }

    pub fn runtime_libraries(&self) -> Vec<PathBuf> {
        if let Some(libs) = &self.runtime_libraries {
            return libs.clone();
        }
        match std::env::var(RUNTIME_LIBS_ENV) {
            Ok(value) => parse_library_list(&value),
            Err(_) => self.tapir_target().default_libraries(),
        }
    }

    pub fn compile_config(&self) -> CompileConfig<'_> {
        CompileConfig {
            opt_level: self.opt_level,
            tapir_target: self.tapir_target(),
            verify: self.verify,
            late_transformer: self.late_transformer.as_ref(),
            asm_printer: self.asm_printer.as_ref(),
        }
    }
}

/// Everything the compile stage needs for one module.
pub struct CompileConfig<'a> {
    pub opt_level: OptLevel,
    pub tapir_target: TapirTarget,
    pub verify: bool,
    pub late_transformer: Option<&'a ModuleTransformer>,
    pub asm_printer: Option<&'a AsmPrinter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tapir_target_parse() {
        assert_eq!(TapirTarget::parse("CUDA"), Some(TapirTarget::Cuda));
        assert_eq!(TapirTarget::parse(""), Some(TapirTarget::Serial));
        assert_eq!(TapirTarget::parse("opencilk"), Some(TapirTarget::OpenCilk));
        assert_eq!(TapirTarget::parse("openmp"), None);
        assert_eq!(TapirTarget::Cuda.id(), 4);
        assert!(TapirTarget::Serial.runtime_symbols().is_empty());
        assert!(TapirTarget::Cuda
            .runtime_symbols()
            .contains(&"__kitcuda_mem_alloc_managed_numba"));
    }

    #[test]
    fn test_library_list() {
        assert_eq!(
            parse_library_list("/opt/a.so::b.so"),
            vec![PathBuf::from("/opt/a.so"), PathBuf::from("b.so")]
        );
    }

    #[test]
    fn test_explicit_options_win() {
        let options = EngineOptions {
            tapir_target: Some(TapirTarget::Cuda),
            runtime_libraries: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(options.tapir_target(), TapirTarget::Cuda);
        assert!(options.runtime_libraries().is_empty());
        let config = options.compile_config();
        assert_eq!(config.tapir_target, TapirTarget::Cuda);
        assert!(config.late_transformer.is_none());
    }
}
