//! # Bytecode to IR translation
//!
//! [`Translator`] lowers a whole [`Unit`] into one IR [`Module`]:
//!
//! 1. the shared layouts and external helpers are declared (`layout`),
//! 2. every ordinary function's signature is entered in the function table,
//! 3. each ordinary function is emitted: metadata pass (`func_info`), then a
//!    region-interleaved walk (`regions`) driving the per-opcode emitter
//!    (`emit`, with calls lowered by `call`),
//! 4. the pseudo-main is declared and emitted last.
//!
//! Ordinary functions take `(typed_value_t* ret, typed_value_t* args...)` and
//! return `void`; the pseudo-main is `i64 main()`.
//!
//! Any error aborts the whole unit; no partial module is returned.

pub mod call;
pub mod emit;
pub mod func_info;
pub mod layout;
pub mod regions;
pub mod translate_error;

use crate::ir::{Function, Module, Type};
use crate::unit::{Func, Unit};

pub use translate_error::{Location, TranslateError};

use emit::FunctionEmitter;
use func_info::FuncInfo;

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// Fail on opcodes outside the modeled subset instead of skipping them.
    pub strict_opcodes: bool,
    pub module_name: String,
    /// IR name given to the unit's pseudo-main.
    pub main_name: String,
    /// Track the value-stack depth while translating and reject bodies that
    /// underflow or exceed their declared capacity.
    pub verify_stack_depth: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        TranslatorConfig {
            strict_opcodes: false,
            module_name: "module".to_string(),
            main_name: "main".to_string(),
            verify_stack_depth: true,
        }
    }
}

/// Owns the module being built for one unit.
pub struct Translator {
    config: TranslatorConfig,
    module: Module,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    pub fn new() -> Self {
        Self::with_config(TranslatorConfig::default())
    }

    pub fn with_config(config: TranslatorConfig) -> Self {
        let module = Module::new(&config.module_name);
        Translator { config, module }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Translate every function of `unit`, ordinary functions first and the
    /// pseudo-main last.
    pub fn translate_unit(mut self, unit: &Unit) -> Result<Module, TranslateError> {
        tracing::info!("translating {} ({} functions)", unit.filepath, unit.funcs.len());
        layout::define_types(&mut self.module);

        let main = unit
            .pseudo_main()
            .ok_or_else(|| TranslateError::MissingMain(unit.filepath.clone()))?;

        let mut ordinary = Vec::new();
        for func in unit.funcs.iter().filter(|f| !f.is_pseudo_main) {
            let idx = self
                .module
                .declare_function(ordinary_decl(func))
                .ok_or_else(|| TranslateError::DuplicateFunction(func.name.clone()))?;
            ordinary.push((func, idx));
        }
        if unit.funcs.iter().filter(|f| f.is_pseudo_main).count() > 1 {
            return Err(TranslateError::DuplicateFunction(self.config.main_name.clone()));
        }

        for (func, idx) in ordinary {
            self.emit_function(unit, func, &func.name, idx)?;
        }

        let main_name = self.config.main_name.clone();
        let idx = self
            .module
            .declare_function(Function::declare(&main_name, Vec::new(), Type::I64))
            .ok_or_else(|| TranslateError::DuplicateFunction(main_name.clone()))?;
        self.emit_function(unit, main, &main_name, idx)?;

        tracing::info!(
            "translated {} into module '{}'",
            unit.filepath,
            self.module.name
        );
        Ok(self.module)
    }

    fn emit_function(
        &mut self,
        unit: &Unit,
        func: &Func,
        name: &str,
        idx: usize,
    ) -> Result<(), TranslateError> {
        let info = FuncInfo::build(unit, func, name)?;
        tracing::debug!(
            "emitting {} [{}, {}) with {} instructions",
            name,
            func.base,
            func.past,
            info.instrs.len()
        );

        let decl = self.module.functions[idx].clone();
        let mut em = FunctionEmitter::new(decl, &mut self.module, &self.config, &info);
        regions::emit_body(&mut em, &info)?;
        let body = em.finish(func.past)?;

        tracing::debug!("{}: {} blocks", name, body.blocks.len());
        self.module.define_function(idx, body);
        Ok(())
    }
}

/// `void name(typed_value_t* ret, typed_value_t* <param>...)`
fn ordinary_decl(func: &Func) -> Function {
    let mut params = Vec::with_capacity(func.params.len() + 1);
    params.push(("ret".to_string(), layout::tv_ptr()));
    for p in &func.params {
        params.push((p.name.clone(), layout::tv_ptr()));
    }
    Function::declare(&func.name, params, Type::Void)
}

/// Translate `unit` with the default configuration.
pub fn translate_unit(unit: &Unit) -> Result<Module, TranslateError> {
    Translator::new().translate_unit(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstKind, Terminator};
    use crate::unit::asm::Assembler;

    fn block_names(f: &Function) -> Vec<&str> {
        f.blocks.iter().map(|b| b.name.as_str()).collect()
    }

    /// main calls `greet("hi")`; `greet` prints its argument.
    fn greeting_unit() -> Unit {
        let mut unit = Unit::new("greet.php");

        let mut main = Assembler::pseudo_main(&mut unit);
        main.fpush_func_d(1, "greet");
        main.string("hi").fpass_c(0).fcall(1).pop_c();
        main.int(1).ret_c();
        main.finish();

        let mut greet = Assembler::new(&mut unit, "greet");
        let who = greet.param("who");
        greet.cget_l(who).print().pop_c().null().ret_c();
        greet.finish();

        unit
    }

    #[test]
    fn test_main_is_emitted_last() {
        let module = translate_unit(&greeting_unit()).unwrap();
        assert_eq!(module.function_names(), vec!["greet", "main"]);

        let main = module.function("main").unwrap();
        assert_eq!(main.ret, Type::I64);
        assert!(main.params.is_empty());
        assert_eq!(main.blocks[0].term, Some(Terminator::Ret(Some(crate::ir::Operand::i64(0)))));

        let greet = module.function("greet").unwrap();
        assert_eq!(greet.params.len(), 2);
        assert!(!greet.is_declaration());
    }

    #[test]
    fn test_call_reaches_callee() {
        let module = translate_unit(&greeting_unit()).unwrap();
        let main = module.function("main").unwrap();
        let call = main
            .insts()
            .find_map(|i| match &i.kind {
                InstKind::Call { callee, args, .. } if callee == "greet" => Some(args.len()),
                _ => None,
            })
            .unwrap();
        assert_eq!(call, 2);
        assert!(module.extern_decl(layout::PUTS).is_some());
        assert_eq!(module.globals.len(), 2);
    }

    #[test]
    fn test_ordinary_functions_call_each_other_in_any_order() {
        let mut unit = Unit::new("t.php");

        let mut a = Assembler::new(&mut unit, "a");
        a.fpush_func_d(0, "b").fcall(0).ret_c();
        a.finish();

        let mut b = Assembler::new(&mut unit, "b");
        b.int(2).ret_c();
        b.finish();

        let mut main = Assembler::pseudo_main(&mut unit);
        main.fpush_func_d(0, "a").fcall(0).pop_c().null().ret_c();
        main.finish();

        let module = translate_unit(&unit).unwrap();
        assert_eq!(module.function_names(), vec!["a", "b", "main"]);
    }

    #[test]
    fn test_unknown_callee_aborts_unit() {
        let mut unit = Unit::new("t.php");
        let mut main = Assembler::pseudo_main(&mut unit);
        main.fpush_func_d(0, "missing").fcall(0).ret_c();
        main.finish();

        let err = translate_unit(&unit).unwrap_err();
        assert!(matches!(err, TranslateError::UnknownCallee { ref at, .. } if at.func == "main"));
    }

    #[test]
    fn test_missing_main() {
        let mut unit = Unit::new("lib.php");
        let mut f = Assembler::new(&mut unit, "f");
        f.null().ret_c();
        f.finish();

        let err = translate_unit(&unit).unwrap_err();
        assert!(matches!(err, TranslateError::MissingMain(ref path) if path == "lib.php"));
    }

    #[test]
    fn test_duplicate_function() {
        let mut unit = Unit::new("t.php");
        for _ in 0..2 {
            let mut f = Assembler::new(&mut unit, "f");
            f.null().ret_c();
            f.finish();
        }
        let mut main = Assembler::pseudo_main(&mut unit);
        main.null().ret_c();
        main.finish();

        let err = translate_unit(&unit).unwrap_err();
        assert!(matches!(err, TranslateError::DuplicateFunction(ref name) if name == "f"));
    }

    #[test]
    fn test_strict_mode_aborts_on_unsupported_opcode() {
        let mut unit = Unit::new("t.php");
        let mut main = Assembler::pseudo_main(&mut unit);
        main.int(1).int(2).add().print().ret_c();
        main.finish();

        assert!(translate_unit(&unit).is_ok());

        let strict = Translator::with_config(TranslatorConfig {
            strict_opcodes: true,
            ..TranslatorConfig::default()
        });
        let err = strict.translate_unit(&unit).unwrap_err();
        assert!(matches!(err, TranslateError::UnsupportedOpcode { .. }));
    }

    #[test]
    fn test_custom_names() {
        let config = TranslatorConfig {
            module_name: "greet".to_string(),
            main_name: "entry".to_string(),
            ..TranslatorConfig::default()
        };
        let module = Translator::with_config(config)
            .translate_unit(&greeting_unit())
            .unwrap();
        assert_eq!(module.name, "greet");
        assert_eq!(module.function_names(), vec!["greet", "entry"]);
    }

    #[test]
    fn test_translation_is_idempotent() {
        let mut unit = Unit::new("t.php");

        let mut f = Assembler::new(&mut unit, "f");
        let x = f.param("x");
        let start = f.bound_label();
        let end = f.new_label();
        let catch = f.new_label();
        let exit = f.new_label();
        f.cget_l(x).jmp_z(exit).string("yes").print().pop_c();
        f.bind(end).jmp(exit);
        f.bind(catch).catch().pop_c();
        f.bind(exit).null().ret_c();
        f.catch_region(start, end, &[("Exception", catch)]);
        f.finish();

        let mut main = Assembler::pseudo_main(&mut unit);
        main.fpush_func_d(1, "f").int(1).fpass_c(0).fcall(1).pop_c().null().ret_c();
        main.finish();

        let first = Translator::new().translate_unit(&unit).unwrap();
        let second = Translator::new().translate_unit(&unit).unwrap();
        assert_eq!(first.function_names(), second.function_names());
        for (a, b) in first.functions.iter().zip(&second.functions) {
            assert_eq!(block_names(a), block_names(b));
        }
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_module_survives_postcard() {
        let module = translate_unit(&greeting_unit()).unwrap();
        let bytes = module.to_bytes().unwrap();
        assert_eq!(Module::from_bytes(&bytes).unwrap(), module);
    }
}
