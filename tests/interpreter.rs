use std::cell::RefCell;

use weft::value::{format_value, make_nil_value, Value};
use weft::{InterpretResult, VM};

thread_local! {
    static OUTPUT: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

fn recording_print(args: &[Value]) -> Result<Value, String> {
    let rendered: Vec<String> = args.iter().map(format_value).collect();
    OUTPUT.with(|output| output.borrow_mut().push(rendered.join(" ")));
    Ok(make_nil_value())
}

/// Run a script with `print` redirected into a per-thread buffer.
fn run(source: &str) -> (InterpretResult, Vec<String>) {
    OUTPUT.with(|output| output.borrow_mut().clear());
    let mut vm = VM::new();
    vm.define_native("print", -1, recording_print);
    let result = vm.interpret(source);
    let lines = OUTPUT.with(|output| output.borrow().clone());
    (result, lines)
}

fn run_ok(source: &str) -> Vec<String> {
    let (result, lines) = run(source);
    assert_eq!(result, InterpretResult::Ok, "script failed: {:?}", lines);
    lines
}

#[test]
fn assigns_and_reads_variables() {
    assert_eq!(run_ok("var x = 1; x = x + 2; print(x);"), vec!["3"]);
}

#[test]
fn closures_share_their_captured_counter() {
    let lines = run_ok(
        "fun make() {
             var n = 0;
             fun inc() {
                 n = n + 1;
                 return n;
             }
             return inc;
         }
         var c = make();
         print(c());
         print(c());",
    );
    assert_eq!(lines, vec!["1", "2"]);
}

#[test]
fn coroutines_yield_values_to_their_awaiter() {
    let lines = run_ok(
        "coroutine g() {
             yield 1;
             yield 2;
         }
         var c = g();
         print(await c);
         print(await c);",
    );
    assert_eq!(lines, vec!["1", "2"]);
}

#[test]
fn lists_index_and_assign() {
    let lines = run_ok(
        "var xs = [1, 2, 3];
         xs[1] = 9;
         print(xs[0] + xs[1] + xs[2]);",
    );
    assert_eq!(lines, vec!["13"]);
}

#[test]
fn dicts_read_and_write_fields() {
    let lines = run_ok(
        "var d = {a: 1, b: 2};
         d.a = d.a + d.b;
         print(d.a);",
    );
    assert_eq!(lines, vec!["3"]);
}

#[test]
fn recursive_fibonacci() {
    let lines = run_ok(
        "fun f(n) {
             if (n <= 1) return n;
             return f(n - 1) + f(n - 2);
         }
         print(f(10));",
    );
    assert_eq!(lines, vec!["55"]);
}

#[test]
fn a_for_loop_with_empty_clauses_loops_until_break() {
    let lines = run_ok(
        "var i = 0;
         for ;; {
             i = i + 1;
             if i == 3 { break; }
         }
         print(i);",
    );
    assert_eq!(lines, vec!["3"]);
}

#[test]
fn a_full_for_loop_counts() {
    let lines = run_ok(
        "var total = 0;
         for var i = 0; i < 5; i = i + 1 {
             total = total + i;
         }
         print(total);",
    );
    assert_eq!(lines, vec!["10"]);
}

#[test]
fn continue_skips_to_the_increment() {
    let lines = run_ok(
        "var total = 0;
         for var i = 0; i < 5; i = i + 1 {
             if i == 2 { continue; }
             total = total + i;
         }
         print(total);",
    );
    assert_eq!(lines, vec!["8"]);
}

#[test]
fn an_initializer_reads_the_outer_binding() {
    let lines = run_ok(
        "var a = 1;
         {
             var a = a + 1;
             print(a);
         }",
    );
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn shadowing_in_one_scope_uses_the_newest_binding() {
    let lines = run_ok(
        "{
             var a = 1;
             var a = 2;
             print(a);
         }",
    );
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn duplicate_dict_keys_keep_the_last_value() {
    let lines = run_ok("var d = {a: 1, a: 2}; print(d.a);");
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn missing_dict_keys_read_as_nil() {
    let lines = run_ok("var d = {a: 1}; print(d.b);");
    assert_eq!(lines, vec!["nil"]);
}

#[test]
fn concatenated_strings_compare_equal_to_literals() {
    let lines = run_ok("print(\"str\" + \"ing\" == \"string\");");
    assert_eq!(lines, vec!["true"]);
}

#[test]
fn string_concatenation_builds_text() {
    let lines = run_ok("print(\"he\" + \"llo\");");
    assert_eq!(lines, vec!["hello"]);
}

#[test]
fn logic_operators_short_circuit() {
    // `missing` is undefined; if `and` evaluated its right side this
    // would be a runtime error instead of printed output.
    let lines = run_ok("print(false and missing);");
    assert_eq!(lines, vec!["false"]);

    let lines = run_ok("print(nil or 2);");
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn if_else_picks_a_branch() {
    let lines = run_ok(
        "if 1 > 2 {
             print(\"then\");
         } else {
             print(\"else\");
         }",
    );
    assert_eq!(lines, vec!["else"]);
}

#[test]
fn anonymous_functions_are_expressions() {
    let lines = run_ok("var double = fun(a) { return a * 2; }; print(double(21));");
    assert_eq!(lines, vec!["42"]);
}

#[test]
fn coroutine_instances_receive_call_arguments() {
    let lines = run_ok(
        "coroutine add(a, b) {
             yield a + b;
         }
         var c = add(3, 4);
         print(await c);",
    );
    assert_eq!(lines, vec!["7"]);
}

#[test]
fn a_completing_coroutine_hands_back_its_return_value() {
    let lines = run_ok(
        "coroutine g() {
             yield 1;
             return 99;
         }
         var c = g();
         print(await c);
         print(await c);",
    );
    assert_eq!(lines, vec!["1", "99"]);
}

#[test]
fn coroutines_nest() {
    let lines = run_ok(
        "coroutine inner() {
             yield 1;
         }
         coroutine outer() {
             var i = inner();
             yield await i;
         }
         var o = outer();
         print(await o);",
    );
    assert_eq!(lines, vec!["1"]);
}

#[test]
fn one_template_spawns_independent_instances() {
    let lines = run_ok(
        "coroutine counter(start) {
             yield start;
             yield start + 1;
         }
         var a = counter(10);
         var b = counter(20);
         print(await a);
         print(await b);
         print(await a);
         print(await b);",
    );
    assert_eq!(lines, vec!["10", "20", "11", "21"]);
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let lines = run_ok(
        "fun make() {
             var x = 0;
             fun bump() { x = x + 1; }
             fun read() { return x; }
             return [bump, read];
         }
         var fns = make();
         fns[0]();
         fns[0]();
         print(fns[1]());",
    );
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn len_reports_sizes() {
    let lines = run_ok("print(len(\"abc\") + len([1, 2]));");
    assert_eq!(lines, vec!["5"]);
}

#[test]
fn string_churn_survives_collection() {
    // Builds a couple of megabytes of short-lived interned strings so the
    // collector runs mid-loop.
    let lines = run_ok(
        "var i = 0;
         var s = \"\";
         while i < 2000 {
             s = s + \"x\";
             i = i + 1;
         }
         print(len(s));",
    );
    assert_eq!(lines, vec!["2000"]);
}

#[test]
fn runtime_errors_surface_as_runtime_errors() {
    let (result, _) = run("var l = [1]; l[5];");
    assert_eq!(result, InterpretResult::RuntimeError);

    let (result, _) = run("await 1;");
    assert_eq!(result, InterpretResult::RuntimeError);

    let (result, _) = run(
        "coroutine g() { return 1; }
         var c = g();
         await c;
         await c;",
    );
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn compile_errors_surface_without_running() {
    let (result, lines) = run("print(1); var = 2;");
    assert_eq!(result, InterpretResult::CompileError);
    assert!(lines.is_empty());
}
