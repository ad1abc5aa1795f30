//! End-to-end interpreter tests: source in, printed output out.
//!
//! Each test compiles and runs a program through the public API and asserts
//! on everything the script printed.

use ember::{CollectStringPrint, Vm, VmConfig};
use pretty_assertions::assert_eq;

/// Runs a script and returns its printed output.
fn run(source: &str) -> String {
    run_with_config(source, VmConfig::default())
}

fn run_with_config(source: &str, config: VmConfig) -> String {
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(config, &mut out);
    if let Err(err) = vm.interpret(source) {
        panic!("script failed: {err}\nsource:\n{source}");
    }
    drop(vm);
    out.take_output()
}

// =============================================================================
// 1. Expressions and statements
// =============================================================================

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run("print 10 - 4 - 3;"), "3\n");
    assert_eq!(run("print -3 + 5;"), "2\n");
}

#[test]
fn integer_and_float_semantics() {
    // Int arithmetic stays Int; mixing promotes to Float.
    assert_eq!(run("print 2 * 3;"), "6\n");
    assert_eq!(run("print 2.5 * 2;"), "5.0\n");
    assert_eq!(run("print 7 / 2;"), "3\n");
    assert_eq!(run("print 7 % 4;"), "3\n");
    // Numeric equality crosses the Int/Float divide.
    assert_eq!(run("print 1 == 1.0;"), "true\n");
}

#[test]
fn comparison_and_logic() {
    assert_eq!(run("print 1 < 2 and 2 <= 2;"), "true\n");
    assert_eq!(run("print 1 > 2 or 3 >= 4;"), "false\n");
    assert_eq!(run("print !nil;"), "true\n");
    assert_eq!(run("print nil == false;"), "false\n");
    // `and`/`or` short-circuit to their deciding operand.
    assert_eq!(run("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(run("print false and missing();"), "false\n");
}

#[test]
fn string_concatenation() {
    let source = r#"
        var a = "foo";
        var b = "bar";
        print a + b;
    "#;
    assert_eq!(run(source), "foobar\n");
}

#[test]
fn interned_strings_compare_by_identity() {
    // Equal string contents are the same heap object, so a freshly
    // concatenated string is `==` to an interned literal.
    let source = r#"
        var a = "foo";
        var b = "bar";
        print a + b == "foobar";
    "#;
    assert_eq!(run(source), "true\n");
}

#[test]
fn string_interpolation() {
    assert_eq!(run(r#"var x = 3; print "a ${x} b";"#), "a 3 b\n");
    assert_eq!(run(r#"print "${1 + 1} and ${"two"}";"#), "2 and two\n");
    // Nested interpolation.
    assert_eq!(run(r#"var n = 1; print "x${"y${n}z"}w";"#), "xy1zw\n");
}

#[test]
fn control_flow() {
    assert_eq!(run("if (1 < 2) print \"yes\"; else print \"no\";"), "yes\n");
    assert_eq!(run("var i = 0; while (i < 3) { print i; i = i + 1; }"), "0\n1\n2\n");
    let source = r"
        var n = 0;
        for (var i = 0; i < 1000; i = i + 1) n = n + i;
        print n;
    ";
    assert_eq!(run(source), "499500\n");
}

#[test]
fn switch_selects_a_single_case() {
    let source = r#"
        var x = 2;
        switch (x) {
            case 1: print "one";
            case 2: print "two";
            case 3: print "three";
            default: print "other";
        }
    "#;
    assert_eq!(run(source), "two\n");
}

#[test]
fn switch_default_runs_on_no_match() {
    let source = r#"
        switch ("zebra") {
            case "ant": print "ant";
            default: print "other";
        }
    "#;
    assert_eq!(run(source), "other\n");
}

#[test]
fn val_bindings_are_readable() {
    assert_eq!(run("val answer = 42; print answer;"), "42\n");
}

// =============================================================================
// 2. Functions, closures, upvalues
// =============================================================================

#[test]
fn function_calls_and_returns() {
    let source = r"
        fun add(a, b) { return a + b; }
        print add(2, 3);
    ";
    assert_eq!(run(source), "5\n");
}

#[test]
fn recursion() {
    let source = r"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(15);
    ";
    assert_eq!(run(source), "610\n");
}

#[test]
fn closures_share_the_captured_variable() {
    // The closure observes writes made after capture.
    let source = r"
        fun make(x) {
            fun g() { return x; }
            x = x + 1;
            return g;
        }
        var g = make(10);
        print g();
    ";
    assert_eq!(run(source), "11\n");
}

#[test]
fn closure_observes_later_assignment() {
    let source = r"
        fun outer() {
            var x = 1;
            fun inner() { return x; }
            x = 2;
            return inner;
        }
        print outer()();
    ";
    assert_eq!(run(source), "2\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = r"
        fun pair() {
            var n = 0;
            fun inc() { n = n + 1; return n; }
            fun get() { return n; }
            inc();
            inc();
            print get();
        }
        pair();
    ";
    assert_eq!(run(source), "2\n");
}

#[test]
fn upvalues_close_when_the_frame_returns() {
    let source = r#"
        var hold = nil;
        fun capture() {
            var local = "kept";
            fun reader() { return local; }
            hold = reader;
        }
        capture();
        print hold();
    "#;
    assert_eq!(run(source), "kept\n");
}

#[test]
fn bound_methods_carry_their_receiver() {
    let source = r#"
        class Counter {
            init() { this.n = 0; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        var m = c.bump;
        m();
        print m();
    "#;
    assert_eq!(run(source), "2\n");
}

// =============================================================================
// 3. Classes, inheritance, traits
// =============================================================================

#[test]
fn class_with_initializer() {
    let source = r#"
        class Greeter {
            init(n) { this.n = n; }
            hello() { return "Hi " + this.n; }
        }
        print Greeter("Lox").hello();
    "#;
    assert_eq!(run(source), "Hi Lox\n");
}

#[test]
fn super_calls_resolve_through_the_superclass() {
    let source = r#"
        class A { f() { return "A"; } }
        class B < A { f() { return super.f() + "B"; } }
        print B().f();
    "#;
    assert_eq!(run(source), "AB\n");
}

#[test]
fn inherited_methods_dispatch_on_the_subclass() {
    let source = r#"
        class Animal { speak() { return this.sound(); } }
        class Dog < Animal { sound() { return "woof"; } }
        print Dog().speak();
    "#;
    assert_eq!(run(source), "woof\n");
}

#[test]
fn every_class_descends_from_object() {
    let source = r#"
        class Plain { }
        var p = Plain();
        print p.getClassName();
        print p.equals(p);
        print p.hasField("missing");
    "#;
    assert_eq!(run(source), "Plain\ntrue\nfalse\n");
}

#[test]
fn static_methods_live_on_the_metaclass() {
    let source = r#"
        class Factory {
            static create() { return Factory(); }
        }
        print Factory.create().getClassName();
    "#;
    assert_eq!(run(source), "Factory\n");
}

#[test]
fn traits_compose_methods_into_classes() {
    let source = r#"
        trait Walks { move() { return "walk"; } }
        class Duck with Walks { }
        print Duck().move();
    "#;
    assert_eq!(run(source), "walk\n");
}

#[test]
fn trait_conflict_last_trait_wins() {
    let source = r#"
        trait Walks { move() { return "walk"; } }
        trait Swims { move() { return "swim"; } }
        class Duck with Walks, Swims { }
        print Duck().move();
    "#;
    assert_eq!(run(source), "swim\n");
}

#[test]
fn class_methods_override_trait_methods() {
    let source = r#"
        trait Swims { move() { return "swim"; } }
        class Fish with Swims {
            move() { return "dart"; }
        }
        print Fish().move();
    "#;
    assert_eq!(run(source), "dart\n");
}

#[test]
fn traits_compose_into_other_traits() {
    let source = r#"
        trait Walks { walk() { return "walk"; } }
        trait Swims { swim() { return "swim"; } }
        trait Amphibious with Walks, Swims { }
        class Frog with Amphibious { }
        print Frog().walk() + "/" + Frog().swim();
    "#;
    assert_eq!(run(source), "walk/swim\n");
}

#[test]
fn fields_shadow_methods_on_invoke() {
    let source = r#"
        fun shout() { return "field wins"; }
        class Holder {
            init() { this.speak = shout; }
            speak() { return "method wins"; }
        }
        print Holder().speak();
    "#;
    assert_eq!(run(source), "field wins\n");
}

// =============================================================================
// 4. Interceptors
// =============================================================================

#[test]
fn undefined_get_interceptor() {
    let source = r#"
        class Spy {
            init() { this.real = 1; }
            __undefinedGet__(name) { return "<" + name + ">"; }
        }
        var s = Spy();
        print s.real;
        print s.missing;
    "#;
    assert_eq!(run(source), "1\n<missing>\n");
}

#[test]
fn before_get_interceptor_short_circuits() {
    let source = r#"
        class Guard {
            init() { this.secret = "hidden"; }
            __beforeGet__(name) {
                if (name == "secret") return "denied";
                return nil;
            }
        }
        print Guard().secret;
    "#;
    assert_eq!(run(source), "denied\n");
}

#[test]
fn after_get_interceptor_transforms_the_value() {
    let source = r#"
        class Doubler {
            init() { this.x = 21; }
            __afterGet__(value, name) { return value + value; }
        }
        print Doubler().x;
    "#;
    assert_eq!(run(source), "42\n");
}

#[test]
fn before_set_interceptor_rewrites_stores() {
    let source = r#"
        class Clamped {
            __beforeSet__(name, value) {
                if (value > 10) return 10;
                return value;
            }
            init() { this.n = 50; }
        }
        print Clamped().n;
    "#;
    assert_eq!(run(source), "10\n");
}

#[test]
fn undefined_invoke_interceptor_gets_name_and_args() {
    let source = r#"
        class Proxy {
            __undefinedInvoke__(name, args) {
                return name + "/" + args.length();
            }
        }
        print Proxy().missing(1, 2, 3);
    "#;
    assert_eq!(run(source), "missing/3\n");
}

// =============================================================================
// 5. Collections
// =============================================================================

#[test]
fn array_literals_and_indexing() {
    let source = r#"
        var xs = [10, 20, 30];
        print xs[1];
        xs[1] = 21;
        print xs[1];
        print xs.length();
        xs.push(40);
        print xs[3];
        print xs.indexOf(30);
        print xs;
    "#;
    assert_eq!(run(source), "20\n21\n3\n40\n2\n[10, 21, 30, 40]\n");
}

#[test]
fn dictionary_literals_and_indexing() {
    let source = r#"
        var d = ["one": 1, "two": 2];
        print d["one"];
        d["three"] = 3;
        print d.length();
        print d["absent"];
        print d.containsKey("two");
        d.remove("two");
        print d.containsKey("two");
    "#;
    assert_eq!(run(source), "1\n3\nnil\ntrue\nfalse\n");
}

#[test]
fn dictionary_keys_unify_int_and_float() {
    let source = r#"
        var d = [:];
        d[1] = "int";
        print d[1.0];
    "#;
    assert_eq!(run(source), "int\n");
}

#[test]
fn string_indexing_and_methods() {
    let source = r#"
        var s = "ember";
        print s[0];
        print s.length();
        print s.indexOf("be");
        print s.substring(1, 3);
        print s.contains("mb");
    "#;
    assert_eq!(run(source), "e\n5\n2\nmb\ntrue\n");
}

#[test]
fn range_objects() {
    let source = r"
        var r = Range(1, 5);
        print r.start();
        print r.end();
        print r.length();
        print r.contains(4);
        print r.contains(5);
    ";
    assert_eq!(run(source), "1\n5\n4\ntrue\nfalse\n");
}

// =============================================================================
// 6. Namespaces
// =============================================================================

#[test]
fn namespace_members_resolve_by_dot() {
    let source = r#"
        namespace util {
            fun helper() { return "helped"; }
            class Tool {
                init() { this.kind = "hammer"; }
            }
        }
        print util.helper();
        print util.Tool().kind;
    "#;
    assert_eq!(run(source), "helped\nhammer\n");
}

#[test]
fn namespace_siblings_see_each_other() {
    let source = r"
        namespace calc {
            fun double(x) { return x * 2; }
            fun quad(x) { return double(double(x)); }
        }
        print calc.quad(3);
    ";
    assert_eq!(run(source), "12\n");
}

#[test]
fn nested_namespaces() {
    let source = r#"
        namespace outer.inner {
            val flag = "deep";
        }
        print outer.inner.flag;
    "#;
    assert_eq!(run(source), "deep\n");
}

// =============================================================================
// 7. Exceptions
// =============================================================================

#[test]
fn try_catch_catches_thrown_exceptions() {
    let source = r#"
        try {
            throw Exception("boom");
            print "unreached";
        } catch (e) {
            print "caught: " + e.getMessage();
        }
    "#;
    assert_eq!(run(source), "caught: boom\n");
}

#[test]
fn catch_matches_by_exception_class() {
    let source = r#"
        class MyError < Exception { }
        try {
            throw MyError("specific");
        } catch (MyError e) {
            print "mine: " + e.getMessage();
        }
    "#;
    assert_eq!(run(source), "mine: specific\n");
}

#[test]
fn unmatched_catch_propagates_to_an_outer_handler() {
    let source = r#"
        class AError < Exception { }
        class BError < Exception { }
        try {
            try {
                throw BError("b");
            } catch (AError e) {
                print "wrong";
            }
        } catch (BError e) {
            print "right";
        }
    "#;
    assert_eq!(run(source), "right\n");
}

#[test]
fn finally_runs_on_the_normal_path() {
    let source = r#"
        try {
            print "try";
        } catch (e) {
            print "catch";
        } finally {
            print "finally";
        }
    "#;
    assert_eq!(run(source), "try\nfinally\n");
}

#[test]
fn finally_runs_when_an_exception_is_caught() {
    let source = r#"
        try {
            throw Exception("x");
        } catch (e) {
            print "catch";
        } finally {
            print "finally";
        }
    "#;
    assert_eq!(run(source), "catch\nfinally\n");
}

#[test]
fn finally_runs_while_unwinding_to_an_outer_handler() {
    let source = r#"
        fun risky() {
            try {
                throw Exception("deep");
            } finally {
                print "inner finally";
            }
        }
        try {
            risky();
        } catch (e) {
            print "outer: " + e.getMessage();
        }
    "#;
    assert_eq!(run(source), "inner finally\nouter: deep\n");
}

#[test]
fn exceptions_unwind_across_call_frames() {
    let source = r#"
        fun level3() { throw Exception("from 3"); }
        fun level2() { level3(); }
        fun level1() { level2(); }
        try {
            level1();
        } catch (e) {
            print e.getMessage();
        }
    "#;
    assert_eq!(run(source), "from 3\n");
}

// =============================================================================
// 8. Generators
// =============================================================================

#[test]
fn generator_yields_in_order_then_finishes() {
    let source = r"
        fun gen() { yield 1; yield 2; yield 3; }
        var g = gen();
        print g.resume();
        print g.resume();
        print g.resume();
        print g.isFinished();
        print g.resume();
        print g.isFinished();
    ";
    assert_eq!(run(source), "1\n2\n3\nfalse\nnil\ntrue\n");
}

#[test]
fn generator_receives_resume_values() {
    let source = r#"
        fun echo() {
            var x = yield "first";
            print "got " + x;
            yield x + "!";
        }
        var g = echo();
        print g.resume();
        print g.resume("hi");
    "#;
    assert_eq!(run(source), "first\ngot hi\nhi!\n");
}

#[test]
fn generator_keeps_local_state_across_suspensions() {
    let source = r"
        fun counter(limit) {
            var i = 0;
            while (i < limit) {
                yield i;
                i = i + 1;
            }
        }
        var g = counter(3);
        print g.resume() + g.resume() + g.resume();
    ";
    assert_eq!(run(source), "3\n");
}

#[test]
fn generator_return_value_surfaces_on_the_last_resume() {
    let source = r#"
        fun gen() { yield 1; return "done"; }
        var g = gen();
        g.resume();
        print g.resume();
        print g.isFinished();
    "#;
    assert_eq!(run(source), "done\ntrue\n");
}

// =============================================================================
// 9. Promises and async
// =============================================================================

#[test]
fn async_function_settles_its_promise() {
    let source = r"
        fun show(v) { print v; }
        async fun f() { return 42; }
        f().then(show);
    ";
    assert_eq!(run(source), "42\n");
}

#[test]
fn await_of_a_fulfilled_promise_continues_eagerly() {
    let source = r#"
        fun show(v) { print v; }
        async fun f() {
            var v = await Promise.resolve("ready");
            return v + "!";
        }
        f().then(show);
    "#;
    assert_eq!(run(source), "ready!\n");
}

#[test]
fn await_suspends_until_the_promise_settles() {
    let source = r#"
        var saved = nil;
        fun exec(resolve, reject) { saved = resolve; }
        async fun f() {
            var v = await Promise(exec);
            print "got " + v;
        }
        f();
        print "before";
        saved("x");
    "#;
    assert_eq!(run(source), "before\ngot x\n");
}

#[test]
fn rejected_await_raises_at_the_await_site() {
    let source = r#"
        var saved = nil;
        fun exec(resolve, reject) { saved = reject; }
        async fun f() {
            try {
                await Promise(exec);
                print "unreached";
            } catch (e) {
                print "caught " + e.getMessage();
            }
        }
        f();
        saved(Exception("bad"));
    "#;
    assert_eq!(run(source), "caught bad\n");
}

#[test]
fn promise_handlers_run_in_registration_order() {
    let source = r#"
        var saved = nil;
        fun exec(resolve, reject) { saved = resolve; }
        fun first(v) { print "first " + v; }
        fun second(v) { print "second " + v; }
        var p = Promise(exec);
        p.then(first);
        p.then(second);
        saved("go");
    "#;
    assert_eq!(run(source), "first go\nsecond go\n");
}

#[test]
fn promise_catch_receives_rejections() {
    let source = r#"
        fun handle(e) { print "handled " + e.getMessage(); }
        fun exec(resolve, reject) { reject(Exception("nope")); }
        Promise(exec).catch(handle);
    "#;
    assert_eq!(run(source), "handled nope\n");
}

// =============================================================================
// 10. Printing and misc
// =============================================================================

#[test]
fn print_forms() {
    assert_eq!(run("print nil;"), "nil\n");
    assert_eq!(run("print true;"), "true\n");
    assert_eq!(run("print 2.5;"), "2.5\n");
    assert_eq!(run("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(run("class C {} print C;"), "<class C>\n");
    assert_eq!(run("class C {} print C();"), "<C instance>\n");
    assert_eq!(run("print clock() > 0;"), "true\n");
}

#[test]
fn to_string_conversions() {
    assert_eq!(run("print toString(42) + \"!\";"), "42!\n");
    assert_eq!(run("print 42.toString();"), "42\n");
}

#[test]
fn backtick_identifiers_allow_keyword_names() {
    assert_eq!(run("var `class` = 5; print `class`;"), "5\n");
}

#[test]
fn block_comments_nest() {
    assert_eq!(run("/* a /* nested */ b */ print 1;"), "1\n");
}

#[test]
fn repeated_interpret_calls_share_globals() {
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(VmConfig::default(), &mut out);
    vm.interpret("var shared = 7;").expect("define should run");
    vm.interpret("print shared;").expect("use should run");
    drop(vm);
    assert_eq!(out.take_output(), "7\n");
}
