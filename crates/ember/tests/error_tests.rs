//! Compile-time and runtime error surfaces.

use ember::{CollectStringPrint, InterpretError, NoPrint, Vm, VmConfig};

/// Runs a script and returns the error it must produce.
fn run_err(source: &str) -> InterpretError {
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(VmConfig::default(), &mut out);
    match vm.interpret(source) {
        Ok(()) => panic!("script should have failed:\n{source}"),
        Err(err) => err,
    }
}

fn compile_error(source: &str) -> String {
    match run_err(source) {
        InterpretError::Compile(errors) => errors.to_string(),
        InterpretError::Runtime(report) => {
            panic!("expected compile error, got runtime error: {report}")
        }
    }
}

fn runtime_error(source: &str) -> String {
    match run_err(source) {
        InterpretError::Runtime(report) => report.message,
        InterpretError::Compile(errors) => {
            panic!("expected runtime error, got compile error: {errors}")
        }
    }
}

// =============================================================================
// 1. Compile errors
// =============================================================================

#[test]
fn invalid_assignment_target() {
    let message = compile_error("var a = 1; var b = 2; a + b = 3;");
    assert!(message.contains("Invalid assignment target."), "got: {message}");
}

#[test]
fn reading_a_local_in_its_own_initializer() {
    let message = compile_error("{ var a = 1; { var a = a; } }");
    assert!(
        message.contains("Can't read local variable in its own initializer."),
        "got: {message}"
    );
}

#[test]
fn duplicate_local_declaration() {
    let message = compile_error("{ var a = 1; var a = 2; }");
    assert!(
        message.contains("Already a variable with this name in this scope."),
        "got: {message}"
    );
}

#[test]
fn return_outside_a_function() {
    let message = compile_error("return 1;");
    assert!(message.contains("Can't return from top-level code."), "got: {message}");
}

#[test]
fn returning_a_value_from_an_initializer() {
    let message = compile_error("class C { init() { return 1; } }");
    assert!(
        message.contains("Can't return a value from an initializer."),
        "got: {message}"
    );
}

#[test]
fn this_outside_a_class() {
    let message = compile_error("print this;");
    assert!(message.contains("Can't use 'this' outside of a class."), "got: {message}");
}

#[test]
fn super_outside_a_class() {
    let message = compile_error("print super.x;");
    assert!(message.contains("Can't use 'super' outside of a class."), "got: {message}");
}

#[test]
fn class_cannot_inherit_from_itself() {
    let message = compile_error("class Loop < Loop { }");
    assert!(message.contains("A class can't inherit from itself."), "got: {message}");
}

#[test]
fn object_cannot_be_redeclared() {
    let message = compile_error("class Object { }");
    assert!(message.contains("Cannot redeclare root class Object."), "got: {message}");
}

#[test]
fn yield_outside_a_function() {
    let message = compile_error("yield 1;");
    assert!(message.contains("Can't yield from top-level code."), "got: {message}");
}

#[test]
fn await_outside_an_async_function() {
    let message = compile_error("fun f() { await 1; }");
    assert!(message.contains("Can't await outside an async function."), "got: {message}");
}

#[test]
fn assigning_to_a_val_local() {
    let message = compile_error("{ val a = 1; a = 2; }");
    assert!(message.contains("Cannot assign to val 'a'."), "got: {message}");
}

#[test]
fn traits_cannot_declare_initializers() {
    let message = compile_error("trait T { init() { } }");
    assert!(message.contains("Traits may not declare initializers."), "got: {message}");
}

#[test]
fn namespace_only_at_top_level() {
    let message = compile_error("fun f() { namespace n { } }");
    assert!(
        message.contains("Namespaces may only be declared at top level."),
        "got: {message}"
    );
}

#[test]
fn panic_mode_recovers_at_statement_boundaries() {
    // Two separate malformed statements produce two diagnostics, not a
    // cascade from the first.
    match run_err("var 1 = 2; var 3 = 4;") {
        InterpretError::Compile(errors) => {
            assert_eq!(errors.errors.len(), 2, "got: {errors}");
        }
        InterpretError::Runtime(report) => panic!("expected compile errors, got: {report}"),
    }
}

#[test]
fn unterminated_string_is_a_lexical_error() {
    let message = compile_error("var s = \"oops;");
    assert!(message.contains("Unterminated string."), "got: {message}");
}

// =============================================================================
// 2. Runtime errors
// =============================================================================

#[test]
fn undefined_variable() {
    let message = runtime_error("print missing;");
    assert!(message.contains("Undefined variable 'missing'."), "got: {message}");
}

#[test]
fn undefined_property() {
    let message = runtime_error("class C { } print C().nope;");
    assert!(message.contains("Undefined property 'nope'."), "got: {message}");
}

#[test]
fn arity_mismatch() {
    let message = runtime_error("fun f(a, b) { } f(1);");
    assert!(message.contains("Expected 2 arguments but got 1."), "got: {message}");
}

#[test]
fn calling_a_non_callable() {
    let message = runtime_error("var x = 1; x();");
    assert!(message.contains("Can only call functions and classes."), "got: {message}");
}

#[test]
fn operand_type_errors() {
    let message = runtime_error("print 1 + nil;");
    assert!(
        message.contains("Operands must be two numbers or two strings."),
        "got: {message}"
    );
    let message = runtime_error("print nil < 1;");
    assert!(message.contains("Operands must be numbers."), "got: {message}");
    let message = runtime_error("print -\"text\";");
    assert!(message.contains("Operand must be a number."), "got: {message}");
}

#[test]
fn integer_division_by_zero() {
    let message = runtime_error("print 1 / 0;");
    assert!(message.contains("Division by zero."), "got: {message}");
    let message = runtime_error("print 1 % 0;");
    assert!(message.contains("Division by zero."), "got: {message}");
}

#[test]
fn stack_overflow_on_runaway_recursion() {
    let message = runtime_error("fun f() { return f(); } f();");
    assert!(message.contains("Stack overflow."), "got: {message}");
}

#[test]
fn reassigning_a_val_global() {
    let message = runtime_error("val k = 1; k = 2;");
    assert!(message.contains("Cannot reassign val 'k'."), "got: {message}");
}

#[test]
fn array_index_out_of_bounds() {
    let message = runtime_error("var xs = [1]; print xs[5];");
    assert!(message.contains("out of bounds"), "got: {message}");
}

#[test]
fn unhashable_dictionary_key() {
    let message = runtime_error("var d = [:]; d[[1]] = 2;");
    assert!(message.contains("Unhashable dictionary key"), "got: {message}");
}

#[test]
fn instantiating_a_trait() {
    let message = runtime_error("trait T { } T();");
    assert!(message.contains("Cannot instantiate a trait."), "got: {message}");
}

#[test]
fn instantiating_a_native_class() {
    let message = runtime_error("String();");
    assert!(
        message.contains("Cannot instantiate native class 'String'."),
        "got: {message}"
    );
}

#[test]
fn resuming_a_finished_generator() {
    let source = r"
        fun gen() { yield 1; }
        var g = gen();
        g.resume();
        g.resume();
        g.resume();
    ";
    let message = runtime_error(source);
    assert!(message.contains("Cannot resume a finished generator."), "got: {message}");
}

#[test]
fn error_native_raises() {
    let message = runtime_error("error(\"from native\");");
    assert!(message.contains("from native"), "got: {message}");
}

#[test]
fn uncaught_exception_reports_message_and_trace() {
    let source = r#"
        fun inner() { throw Exception("kaboom"); }
        fun outer() { inner(); }
        outer();
    "#;
    match run_err(source) {
        InterpretError::Runtime(report) => {
            assert_eq!(report.message, "kaboom");
            assert!(
                report.stack_trace.iter().any(|frame| frame.contains("in inner")),
                "trace should name the throwing function: {:?}",
                report.stack_trace
            );
            assert!(
                report.stack_trace.iter().any(|frame| frame.contains("in script")),
                "trace should reach the script frame: {:?}",
                report.stack_trace
            );
        }
        InterpretError::Compile(errors) => panic!("expected runtime error, got: {errors}"),
    }
}

#[test]
fn compile_errors_carry_line_numbers() {
    match run_err("var ok = 1;\nvar bad = ;\n") {
        InterpretError::Compile(errors) => {
            assert_eq!(errors.errors[0].line, 2, "got: {errors}");
        }
        InterpretError::Runtime(report) => panic!("expected compile error, got: {report}"),
    }
}

#[test]
fn the_vm_recovers_after_a_runtime_error() {
    let mut out = NoPrint;
    let mut vm = Vm::new(VmConfig::default(), &mut out);
    assert!(vm.interpret("print missing;").is_err());
    // The next script runs on a clean stack.
    assert!(vm.interpret("print 1;").is_ok());
}
