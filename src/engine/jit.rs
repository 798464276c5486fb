// This module implements the execution engine. Loading a module compiles it to a native
// object (or takes the object from the cache when the module identity was compiled
// before), creates an isolated ORC LLJIT instance for it, installs a process symbol
// generator, the caller's symbol table and the resolved runtime-support symbols, and adds
// the object into the main dylib of that instance. Symbols of different modules are
// isolated because each lives in its own LLJIT. The `module<N>` namespace a loaded
// module gets is only a label for logs and diagnostics. Callers hold an opaque handle;
// lookups go through it and copy error messages out of LLVM before returning.
// Releasing a handle disposes its JIT and with it the module's code and symbols.
//
// The compile stage is a free function over a `CompileConfig`: it runs the late
// transformer, stamps target cpu and features, substitutes the managed allocator for the
// cuda target, runs the two optimization stages and emits the object (and assembly text
// when a sink is installed). Tapirification runs on a copy of the arena IR right before
// translation, since a stock LLVM has no tapir instructions to split loops into.
//
// Runtime symbols are resolved once per engine. A runtime symbol that a module declares
// but nobody provides is unrecoverable: the engine logs it and aborts the process.
// The LLVM C API exposes no JITDylib initializer entry point, so no static initializers
// are run on load; lowered modules never contain any.

//! ORC-based execution engine.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::ptr;

use hashbrown::HashMap;
use inkwell::context::Context;
use inkwell::module::Module as LlvmModule;
use inkwell::targets::{FileType, TargetMachine};
use llvm_sys::error::{LLVMDisposeErrorMessage, LLVMErrorRef, LLVMGetErrorMessage};
use llvm_sys::orc2::lljit::{
    LLVMOrcCreateLLJIT, LLVMOrcDisposeLLJIT, LLVMOrcLLJITAddObjectFile, LLVMOrcLLJITGetGlobalPrefix,
    LLVMOrcLLJITGetMainJITDylib, LLVMOrcLLJITLookup, LLVMOrcLLJITMangleAndIntern, LLVMOrcLLJITRef,
};
use llvm_sys::orc2::{
    LLVMJITEvaluatedSymbol, LLVMJITSymbolFlags, LLVMJITSymbolGenericFlags, LLVMOrcAbsoluteSymbols,
    LLVMOrcCSymbolMapPair, LLVMOrcCreateDynamicLibrarySearchGeneratorForProcess,
    LLVMOrcDisposeMaterializationUnit, LLVMOrcExecutorAddress, LLVMOrcJITDylibAddGenerator,
    LLVMOrcJITDylibDefine,
};
use log::{debug, error, info, trace, warn};

use super::cache::ObjectCache;
use super::config::{CompileConfig, EngineOptions, TapirTarget};
use super::symbols::RuntimeSymbols;
use super::tapirify::tapirify_module;
use crate::core::error::{EngineError, EngineResult};
use crate::ir::module::Module;
use crate::ir::ops::OpKind;
use crate::llvm::passes::{
    annotate_module, host_target_machine, run_stage_one, run_stage_two, stamp_target_attributes,
    substitute_allocator,
};
use crate::llvm::translate_module;

/// Opaque handle of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u64);

impl ModuleHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

struct LoadedModule {
    /// Diagnostic label; not the name of any JITDylib.
    namespace: String,
    jit: LLVMOrcLLJITRef,
}

impl LoadedModule {
    fn dispose(&mut self) -> EngineResult<()> {
        if self.jit.is_null() {
            return Ok(());
        }
        // SAFETY: the JIT was created by LLVMOrcCreateLLJIT and is disposed once.
        let err = unsafe { LLVMOrcDisposeLLJIT(self.jit) };
        self.jit = ptr::null_mut();
        check(err, EngineError::Jit)
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            warn!("disposing {}: {}", self.namespace, err);
        }
    }
}

/// Message of `err`, or `None` for success. Consumes the error.
fn take_error(err: LLVMErrorRef) -> Option<String> {
    if err.is_null() {
        return None;
    }
    // SAFETY: LLVMGetErrorMessage consumes the error; the message is copied
    // before it is disposed.
    unsafe {
        let raw = LLVMGetErrorMessage(err);
        let message = CStr::from_ptr(raw).to_string_lossy().into_owned();
        LLVMDisposeErrorMessage(raw);
        Some(message)
    }
}

fn check(err: LLVMErrorRef, wrap: fn(String) -> EngineError) -> EngineResult<()> {
    match take_error(err) {
        Some(message) => Err(wrap(message)),
        None => Ok(()),
    }
}

fn fatal(err: EngineError) -> ! {
    error!("{}", err);
    std::process::abort()
}

/// Run the compile stage on `module` and return the object file bytes.
pub fn compile_object(
    module: &LlvmModule<'_>,
    machine: &TargetMachine,
    config: &CompileConfig<'_>,
) -> EngineResult<Vec<u8>> {
    if let Some(transform) = config.late_transformer {
        transform(module).map_err(EngineError::Transform)?;
    }
    stamp_target_attributes(module, machine);
    if config.tapir_target == TapirTarget::Cuda {
        substitute_allocator(module);
    }
    run_stage_one(module, machine)?;
    run_stage_two(module, machine, config.opt_level, config.verify)?;
    if let Some(printer) = config.asm_printer {
        let asm = machine
            .write_to_memory_buffer(module, FileType::Assembly)
            .map_err(|e| EngineError::Codegen(e.to_string()))?;
        printer(&String::from_utf8_lossy(asm.as_slice()));
    }
    let object = machine
        .write_to_memory_buffer(module, FileType::Object)
        .map_err(|e| EngineError::Codegen(e.to_string()))?;
    Ok(object.as_slice().to_vec())
}

/// Names of the external declarations of `m`.
fn declared_symbols(m: &Module) -> Vec<String> {
    m.functions()
        .into_iter()
        .filter(|f| m.region_blocks(m.region(*f, 0)).is_empty())
        .filter_map(|f| match m.kind(f) {
            OpKind::Func { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

pub struct ExecutionEngine {
    options: EngineOptions,
    cache: Option<ObjectCache>,
    runtime: Option<RuntimeSymbols>,
    modules: HashMap<u64, LoadedModule>,
    next_handle: u64,
    next_namespace: u64,
    objects_compiled: usize,
}

impl ExecutionEngine {
    pub fn new(options: EngineOptions) -> Self {
        let cache = options.enable_object_cache.then(ObjectCache::new);
        info!("creating execution engine ({:?})", options);
        Self {
            options,
            cache,
            runtime: None,
            modules: HashMap::new(),
            next_handle: 1,
            next_namespace: 0,
            objects_compiled: 0,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Number of objects produced by the code generator so far.
    pub fn objects_compiled(&self) -> usize {
        self.objects_compiled
    }

    pub fn loaded_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn cache(&self) -> Option<&ObjectCache> {
        self.cache.as_ref()
    }

    fn runtime_symbols(&mut self) -> &RuntimeSymbols {
        let options = &self.options;
        self.runtime.get_or_insert_with(|| {
            RuntimeSymbols::resolve(&options.symbol_map, options.tapir_target(), &options.runtime_libraries())
                .unwrap_or_else(|err| fatal(err))
        })
    }

    /// Caller symbols plus the runtime symbols they do not override.
    fn symbol_table(&mut self, m: &Module) -> Vec<(String, usize)> {
        let declared = declared_symbols(m);
        let runtime = self.runtime_symbols().clone();
        if let Err(err) = runtime.check_declared(declared.iter().map(String::as_str), &self.options.symbol_map) {
            fatal(err);
        }
        let mut table: Vec<(String, usize)> = self
            .options
            .symbol_map
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (name, addr) in runtime.iter() {
            if !self.options.symbol_map.contains_key(name) {
                table.push((name.to_string(), addr));
            }
        }
        table
    }

    fn unique_namespace(&mut self) -> String {
        loop {
            let name = format!("module{}", self.next_namespace);
            self.next_namespace += 1;
            if !self.modules.values().any(|loaded| loaded.namespace == name) {
                return name;
            }
        }
    }

    fn compile(&mut self, m: &Module) -> EngineResult<Vec<u8>> {
        let config = self.options.compile_config();
        let mut ir = m.clone();
        tapirify_module(&mut ir, config.tapir_target);

        let context = Context::create();
        let module = translate_module(&context, &ir)?;
        let machine = host_target_machine(self.options.opt_level)?;
        annotate_module(&module, &machine);
        if let Some(transform) = &self.options.transformer {
            transform(&module).map_err(EngineError::Transform)?;
        }
        let object = compile_object(&module, &machine, &config)?;
        self.objects_compiled += 1;
        debug!("compiled {} into {} bytes", m.name(), object.len());
        Ok(object)
    }

    /// Compile `m` (or reuse its cached object) and load it into a fresh JIT
    /// instance labelled with a new namespace.
    pub fn load_module(&mut self, m: &Module) -> EngineResult<ModuleHandle> {
        let identity = m.name().to_string();
        let symbols = self.symbol_table(m);
        let object = match self.cache.as_ref().and_then(|c| c.get_object(&identity)) {
            Some(object) => {
                debug!("object cache hit for {}", identity);
                object
            }
            None => {
                let object = self.compile(m)?;
                if let Some(cache) = &mut self.cache {
                    cache.notify_object_compiled(&identity, &object);
                }
                object
            }
        };

        let namespace = self.unique_namespace();
        let mut loaded = LoadedModule {
            namespace: namespace.clone(),
            jit: ptr::null_mut(),
        };
        // SAFETY: every handle used below is created here and owned by
        // `loaded`, which disposes the JIT on every exit path.
        unsafe {
            check(LLVMOrcCreateLLJIT(&mut loaded.jit, ptr::null_mut()), EngineError::Jit)?;
            let dylib = LLVMOrcLLJITGetMainJITDylib(loaded.jit);

            let mut generator = ptr::null_mut();
            check(
                LLVMOrcCreateDynamicLibrarySearchGeneratorForProcess(
                    &mut generator,
                    LLVMOrcLLJITGetGlobalPrefix(loaded.jit),
                    None,
                    ptr::null_mut(),
                ),
                EngineError::Jit,
            )?;
            LLVMOrcJITDylibAddGenerator(dylib, generator);

            let flags = LLVMJITSymbolFlags {
                GenericFlags: LLVMJITSymbolGenericFlags::LLVMJITSymbolGenericFlagsExported as u8
                    | LLVMJITSymbolGenericFlags::LLVMJITSymbolGenericFlagsCallable as u8,
                TargetFlags: 0,
            };
            let mut pairs: Vec<LLVMOrcCSymbolMapPair> = symbols
                .iter()
                .filter_map(|(name, addr)| {
                    let cname = CString::new(name.as_str()).ok()?;
                    Some(LLVMOrcCSymbolMapPair {
                        Name: LLVMOrcLLJITMangleAndIntern(loaded.jit, cname.as_ptr()),
                        Sym: LLVMJITEvaluatedSymbol {
                            Address: *addr as LLVMOrcExecutorAddress,
                            Flags: LLVMJITSymbolFlags {
                                GenericFlags: flags.GenericFlags,
                                TargetFlags: flags.TargetFlags,
                            },
                        },
                    })
                })
                .collect();
            if !pairs.is_empty() {
                let unit = LLVMOrcAbsoluteSymbols(pairs.as_mut_ptr(), pairs.len());
                let err = LLVMOrcJITDylibDefine(dylib, unit);
                if !err.is_null() {
                    LLVMOrcDisposeMaterializationUnit(unit);
                    check(err, EngineError::Jit)?;
                }
            }

            let buffer_name = CString::new(identity.as_str()).unwrap_or_default();
            let buffer = llvm_sys::core::LLVMCreateMemoryBufferWithMemoryRangeCopy(
                object.as_ptr() as *const c_char,
                object.len(),
                buffer_name.as_ptr(),
            );
            check(LLVMOrcLLJITAddObjectFile(loaded.jit, dylib, buffer), EngineError::Jit)?;
        }

        let handle = ModuleHandle(self.next_handle);
        self.next_handle += 1;
        info!("loaded {} as {} ({} symbols installed)", identity, namespace, symbols.len());
        self.modules.insert(handle.0, loaded);
        Ok(handle)
    }

    /// Namespace label of `handle`, as it appears in the engine's logs.
    pub fn namespace(&self, handle: ModuleHandle) -> EngineResult<&str> {
        self.modules
            .get(&handle.0)
            .map(|loaded| loaded.namespace.as_str())
            .ok_or(EngineError::UnknownHandle(handle.0))
    }

    /// Address of `name` in the module loaded as `handle`.
    pub fn lookup(&self, handle: ModuleHandle, name: &str) -> EngineResult<*const c_void> {
        let loaded = self
            .modules
            .get(&handle.0)
            .ok_or(EngineError::UnknownHandle(handle.0))?;
        let cname = CString::new(name).map_err(|e| EngineError::Lookup(e.to_string()))?;
        let mut addr: LLVMOrcExecutorAddress = 0;
        // SAFETY: the JIT is alive while the module is loaded.
        let err = unsafe { LLVMOrcLLJITLookup(loaded.jit, &mut addr, cname.as_ptr()) };
        check(err, EngineError::Lookup)?;
        if addr == 0 {
            return Err(EngineError::NullSymbol);
        }
        trace!("{} in {} at {:#x}", name, loaded.namespace, addr);
        Ok(addr as usize as *const c_void)
    }

    /// Dispose the JIT instance of `handle` together with its code.
    pub fn release_module(&mut self, handle: ModuleHandle) -> EngineResult<()> {
        let mut loaded = self
            .modules
            .remove(&handle.0)
            .ok_or(EngineError::UnknownHandle(handle.0))?;
        debug!("releasing {}", loaded.namespace);
        loaded.dispose()
    }

    /// Write the single cached object to `path`.
    pub fn dump_to_object_file(&self, path: &Path) -> EngineResult<()> {
        match &self.cache {
            Some(cache) => cache.dump_to_object_file(path),
            None => Err(EngineError::Cache(
                "cannot dump object code to file: object cache is disabled".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::build_func;
    use crate::ir::builder::Builder;
    use crate::ir::ops::BinOp;
    use crate::ir::types::Type;

    fn add_module(name: &str) -> Module {
        let mut m = Module::new(name);
        let (_, entry) = build_func(&mut m, "add", vec![Type::i64(), Type::i64()], vec![Type::i64()]);
        let a = m.block_arg(entry, 0);
        let b = m.block_arg(entry, 1);
        let mut builder = Builder::at_end(&mut m, entry);
        let sum = builder.binary(BinOp::AddI, a, b);
        builder.return_(vec![sum]);
        m
    }

    fn options() -> EngineOptions {
        EngineOptions {
            tapir_target: Some(TapirTarget::Serial),
            runtime_libraries: Some(Vec::new()),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_lookup_call_release() {
        let mut engine = ExecutionEngine::new(options());
        let handle = engine.load_module(&add_module("adder")).unwrap();
        let ptr = engine.lookup(handle, "add").unwrap();
        let add: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(ptr) };
        assert_eq!(add(40, 2), 42);

        assert!(matches!(engine.lookup(handle, "missing"), Err(EngineError::Lookup(_))));
        engine.release_module(handle).unwrap();
        assert!(matches!(
            engine.lookup(handle, "add"),
            Err(EngineError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_namespaces_are_distinct() {
        let mut engine = ExecutionEngine::new(options());
        let first = engine.load_module(&add_module("a")).unwrap();
        let second = engine.load_module(&add_module("b")).unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.loaded_modules(), 2);
        assert_eq!(engine.namespace(first).unwrap(), "module0");
        assert_eq!(engine.namespace(second).unwrap(), "module1");
        // the same symbol name resolves per module
        assert_ne!(engine.lookup(first, "add").unwrap(), engine.lookup(second, "add").unwrap());

        engine.release_module(first).unwrap();
        assert!(matches!(engine.namespace(first), Err(EngineError::UnknownHandle(_))));
        let third = engine.load_module(&add_module("c")).unwrap();
        assert_eq!(engine.namespace(third).unwrap(), "module2");
    }

    #[test]
    fn test_transformer_failure_aborts_load() {
        let mut engine = ExecutionEngine::new(EngineOptions {
            transformer: Some(Box::new(|_| Err("rejected".to_string()))),
            ..options()
        });
        assert_eq!(
            engine.load_module(&add_module("t")),
            Err(EngineError::Transform("rejected".into()))
        );
        assert_eq!(engine.objects_compiled(), 0);
    }

    #[test]
    fn test_asm_printer_receives_text() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(String::new()));
        let sink = seen.clone();
        let mut engine = ExecutionEngine::new(EngineOptions {
            asm_printer: Some(Box::new(move |asm| sink.borrow_mut().push_str(asm))),
            ..options()
        });
        engine.load_module(&add_module("asm")).unwrap();
        assert!(seen.borrow().contains("add"));
    }

    #[test]
    fn test_dump_without_cache_fails() {
        let engine = ExecutionEngine::new(EngineOptions {
            enable_object_cache: false,
            ..options()
        });
        assert!(matches!(
            engine.dump_to_object_file(Path::new("unused.o")),
            Err(EngineError::Cache(_))
        ));
    }
}
