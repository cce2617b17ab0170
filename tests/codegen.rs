//! Pruebas de integración del pipeline completo: texto fuente →
//! declaraciones → módulo LLVM → IR optimizado.

use std::rc::Rc;

use inkwell::context::Context;
use kalc::{
    codegen::Generator,
    lex::Lexer,
    parse::{Declaration, Parser},
    source::SourceMap,
};

/// Compila un programa entero y recolecta los mensajes de error de
/// parser y generador, como lo hace el driver.
fn compile<'ctx>(llvm: &'ctx Context, source: &str) -> (Generator<'ctx>, Vec<String>) {
    let map = Rc::new(SourceMap::new("<test>", source));
    let mut parser = Parser::new(Lexer::new(map, source));
    let mut generator = Generator::new(llvm, "test", None).expect("host target machine");

    let mut errors = Vec::new();
    while let Some(declaration) = parser.parse() {
        match declaration {
            Declaration::Error(error) => errors.push(error.value.to_string()),
            declaration => {
                if let Err(error) = generator.declaration(&declaration) {
                    errors.push(error.value.to_string());
                }
            }
        }
    }

    (generator, errors)
}

fn emitted_ir(generator: &Generator<'_>) -> String {
    let mut buffer = Vec::new();
    generator.emit_ir(&mut buffer).expect("IR emission");
    String::from_utf8(buffer).expect("IR listings are UTF-8")
}

#[test]
fn arithmetic_folds_to_a_constant() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def a() 1+2*3;");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let ir = emitted_ir(&generator);
    assert!(ir.contains("define double @a()"), "emitted IR:\n{}", ir);
    assert!(ir.contains("ret double 7"), "emitted IR:\n{}", ir);
}

#[test]
fn comparison_produces_one_on_true() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def t() 1 < 2 + 3 * 4;");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let ir = emitted_ir(&generator);
    assert!(ir.contains("ret double 1"), "emitted IR:\n{}", ir);
}

#[test]
fn branches_lower_into_the_function() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def m(x y) if x<y then y else x;");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let ir = emitted_ir(&generator);
    assert!(
        ir.contains("define double @m(double %x, double %y)"),
        "emitted IR:\n{}",
        ir
    );
}

#[test]
fn recursion_survives_the_pipeline() {
    let llvm = Context::create();
    let (generator, errors) = compile(
        &llvm,
        "def fib(n) if n<2 then n else fib(n-1)+fib(n-2);",
    );

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let ir = emitted_ir(&generator);
    assert!(ir.contains("define double @fib(double %n)"), "emitted IR:\n{}", ir);
    assert!(ir.contains("call double @fib"), "emitted IR:\n{}", ir);
}

#[test]
fn loops_yield_zero() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def s(n) for i=0, i<n, 1.0 in 0.0;");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let ir = emitted_ir(&generator);
    assert!(ir.contains("define double @s(double %n)"), "emitted IR:\n{}", ir);
    assert!(ir.contains("ret double 0"), "emitted IR:\n{}", ir);
}

#[test]
fn externs_become_declarations() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "extern sin(x) def f(x) sin(x);");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let ir = emitted_ir(&generator);
    assert!(ir.contains("declare double @sin(double"), "emitted IR:\n{}", ir);
    assert!(ir.contains("call double @sin"), "emitted IR:\n{}", ir);
}

#[test]
fn repeated_externs_are_allowed() {
    let llvm = Context::create();
    let (_, errors) = compile(&llvm, "extern sin(x) extern sin(x) def f(x) sin(x);");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
}

#[test]
fn conflicting_arities_are_rejected() {
    let llvm = Context::create();
    let (_, errors) = compile(&llvm, "extern f(x) extern f(x y)");

    assert_eq!(errors, vec!["conflicting declarations of `f`".to_owned()]);
}

#[test]
fn redefinitions_keep_the_first_body() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def f() 1; def f() 2;");

    assert_eq!(errors, vec!["function `f` cannot be redefined".to_owned()]);
    let ir = emitted_ir(&generator);
    assert!(ir.contains("ret double 1"), "emitted IR:\n{}", ir);
    assert!(!ir.contains("ret double 2"), "emitted IR:\n{}", ir);
}

#[test]
fn unknown_variables_erase_the_function() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def f(x) y;");

    assert_eq!(errors, vec!["unknown variable `y`".to_owned()]);
    assert!(generator.module().get_function("f").is_none());
}

#[test]
fn unknown_functions_are_reported() {
    let llvm = Context::create();
    let (_, errors) = compile(&llvm, "def h() nope();");

    assert_eq!(errors, vec!["unknown function `nope`".to_owned()]);
}

#[test]
fn arity_mismatches_are_reported() {
    let llvm = Context::create();
    let (_, errors) = compile(&llvm, "extern pow(x y) def p(x) pow(x, 2, 3);");

    assert_eq!(
        errors,
        vec!["function `pow` takes 2 arguments, 3 were supplied".to_owned()],
    );
}

#[test]
fn assignments_store_into_the_slot() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def g(x) (x = 4) + x;");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let ir = emitted_ir(&generator);
    assert!(ir.contains("ret double 8"), "emitted IR:\n{}", ir);
}

#[test]
fn assignments_require_an_lvalue() {
    let llvm = Context::create();
    let (_, errors) = compile(&llvm, "def g(x) (x + 1) = 2;");

    assert_eq!(
        errors,
        vec!["destination of '=' must be a variable".to_owned()],
    );
}

#[test]
fn recovery_skips_bad_declarations_only() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def !; def f() 1;");

    assert_eq!(errors.len(), 1, "errors: {:?}", errors);
    assert!(generator.module().get_function("f").is_some());
}

#[test]
fn object_emission_writes_bytes() {
    let llvm = Context::create();
    let (generator, errors) = compile(&llvm, "def a() 1+2*3;");

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    let mut buffer = Vec::new();
    generator.emit_obj(&mut buffer).expect("object emission");
    assert!(!buffer.is_empty());
}
