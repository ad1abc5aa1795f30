//! Garbage collector tests: the same programs must behave identically with
//! the collector forced to run on every allocation, and heap statistics
//! should reflect collection and promotion.

use ember::{CollectStringPrint, Vm, VmConfig};
use pretty_assertions::assert_eq;

fn run_stressed(source: &str) -> String {
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(VmConfig::stress(), &mut out);
    if let Err(err) = vm.interpret(source) {
        panic!("script failed under stress GC: {err}\nsource:\n{source}");
    }
    drop(vm);
    out.take_output()
}

// =============================================================================
// 1. Observable behavior is GC-independent
// =============================================================================

#[test]
fn loop_sum_survives_stress_collection() {
    let source = r"
        var n = 0;
        for (var i = 0; i < 1000; i = i + 1) n = n + i;
        print n;
    ";
    assert_eq!(run_stressed(source), "499500\n");
}

#[test]
fn string_building_survives_stress_collection() {
    let source = r#"
        var s = "";
        for (var i = 0; i < 50; i = i + 1) s = s + "x";
        print s.length();
        print s == s + "";
    "#;
    assert_eq!(run_stressed(source), "50\ntrue\n");
}

#[test]
fn closures_and_upvalues_survive_stress_collection() {
    let source = r"
        fun make(x) {
            fun g() { return x; }
            x = x + 1;
            return g;
        }
        var g = make(10);
        print g();
    ";
    assert_eq!(run_stressed(source), "11\n");
}

#[test]
fn classes_and_instances_survive_stress_collection() {
    let source = r#"
        class Node {
            init(value) { this.value = value; this.next = nil; }
        }
        var head = Node(0);
        var cur = head;
        for (var i = 1; i < 30; i = i + 1) {
            cur.next = Node(i);
            cur = cur.next;
        }
        var sum = 0;
        cur = head;
        while (cur != nil) {
            sum = sum + cur.value;
            cur = cur.next;
        }
        print sum;
    "#;
    assert_eq!(run_stressed(source), "435\n");
}

#[test]
fn generators_survive_stress_collection() {
    let source = r"
        fun gen() { yield 1; yield 2; yield 3; }
        var g = gen();
        print g.resume() + g.resume() + g.resume();
    ";
    assert_eq!(run_stressed(source), "6\n");
}

#[test]
fn exceptions_survive_stress_collection() {
    let source = r#"
        fun boom() { throw Exception("stressed"); }
        try {
            boom();
        } catch (e) {
            print e.getMessage();
        }
    "#;
    assert_eq!(run_stressed(source), "stressed\n");
}

#[test]
fn collections_survive_stress_collection() {
    let source = r#"
        var d = [:];
        for (var i = 0; i < 40; i = i + 1) {
            d["key" + toString(i)] = [i, i * 2];
        }
        print d.length();
        print d["key7"][1];
    "#;
    assert_eq!(run_stressed(source), "40\n14\n");
}

// =============================================================================
// 2. Heap statistics
// =============================================================================

#[test]
fn garbage_is_reclaimed_under_stress() {
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(VmConfig::stress(), &mut out);
    // Allocate plenty of short-lived arrays; only the last survives in a
    // global. With stress GC every allocation collects, so dead arrays
    // cannot pile up.
    vm.interpret(
        r"
        var keep = nil;
        for (var i = 0; i < 200; i = i + 1) keep = [i];
        ",
    )
    .expect("script should run");
    let stats = vm.heap_stats();
    let arrays = stats.objects_by_type.get("Array").copied().unwrap_or(0);
    assert!(
        arrays < 20,
        "dead arrays should be reclaimed, found {arrays} live (stats: {stats:?})"
    );
    assert!(
        stats.free_slots > 0,
        "collections should have recycled slots, stats: {stats:?}"
    );
}

#[test]
fn long_lived_objects_are_promoted_out_of_eden() {
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(VmConfig::stress(), &mut out);
    vm.interpret(
        r"
        var keep = [1, 2, 3];
        var churn = nil;
        for (var i = 0; i < 100; i = i + 1) churn = [i];
        ",
    )
    .expect("script should run");
    let stats = vm.heap_stats();
    let older: usize = stats.bytes_by_generation[1..].iter().sum();
    assert!(
        older > 0,
        "survivors should have been promoted past Eden, stats: {stats:?}"
    );
}

#[test]
fn interned_strings_are_collected_when_dead() {
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(VmConfig::stress(), &mut out);
    let before = vm.heap_stats().interned_strings;
    vm.interpret(
        r#"
        var tail = "";
        for (var i = 0; i < 100; i = i + 1) {
            // Each iteration's intermediate string is garbage immediately.
            tail = "prefix" + toString(i);
        }
        print tail;
        "#,
    )
    .expect("script should run");
    let after = vm.heap_stats().interned_strings;
    drop(vm);
    assert_eq!(out.take_output(), "prefix99\n");
    // The loop built ~200 distinct strings; only a handful may outlive it.
    let grown = after.saturating_sub(before);
    assert!(
        grown < 60,
        "dead interned strings should have been removed, {grown} new entries remain"
    );
}

#[test]
fn default_config_still_collects_eventually() {
    // A small Eden forces collections without stress mode.
    let mut config = VmConfig::default();
    config.gc_eden_heap_size = 8 * 1024;
    let mut out = CollectStringPrint::new();
    let mut vm = Vm::new(config, &mut out);
    vm.interpret(
        r"
        var keep = nil;
        for (var i = 0; i < 2000; i = i + 1) keep = [i, i, i, i];
        print keep[3];
        ",
    )
    .expect("script should run");
    let stats = vm.heap_stats();
    drop(vm);
    assert_eq!(out.take_output(), "1999\n");
    assert!(
        stats.free_slots > 0,
        "threshold-driven collection should have freed slots, stats: {stats:?}"
    );
}
