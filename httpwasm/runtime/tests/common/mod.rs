//! WAT guest modules used by the integration tests.
//!
//! Every module built with [`module`] shares a bump allocator that counts
//! live allocations. `free` traps when nothing is live, so a double free
//! shows up as a cleanup failure, and the heap resets once everything has
//! been released.

#![allow(dead_code)]

const IMPORTS: &str = r#"
  (import "httpwasm" "read_input" (func $read_input (result i64)))
  (import "httpwasm" "write_output" (func $write_output (param i32 i32)))
  (import "httpwasm" "write_diagnostic" (func $write_diagnostic (param i32 i32)))
  (import "httpwasm" "read_env" (func $read_env (param i32 i32) (result i64)))
"#;

const PRELUDE: &str = r#"
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 4096))
  (global $live (mut i32) (i32.const 0))
  (func $alloc (export "alloc") (param $size i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap
      (i32.and
        (i32.add (i32.add (global.get $heap) (local.get $size)) (i32.const 7))
        (i32.const -8)))
    (global.set $live (i32.add (global.get $live) (i32.const 1)))
    (local.get $p))
  (func $free (export "free") (param $p i32)
    (if (i32.eqz (global.get $live)) (then unreachable))
    (global.set $live (i32.sub (global.get $live) (i32.const 1)))
    (if (i32.eqz (global.get $live)) (then (global.set $heap (i32.const 4096)))))
  (func $ptr (param $h i64) (result i32)
    (i32.wrap_i64 (i64.shr_u (local.get $h) (i64.const 32))))
  (func $len (param $h i64) (result i32)
    (i32.wrap_i64 (local.get $h)))
  (func $assert_no_live
    (if (global.get $live) (then unreachable)))
"#;

/// Escape `s` for a WAT string literal.
pub fn wat_str(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// A module with the host imports, memory, allocator and `body`.
pub fn module(body: &str) -> String {
    module_with_imports("", body)
}

/// Like [`module`], with additional imports.
pub fn module_with_imports(imports: &str, body: &str) -> String {
    format!("(module {IMPORTS} {imports} {PRELUDE} {body})")
}

/// Echoes the input (without its terminator) and writes `echo` as a
/// diagnostic. Traps if an earlier call leaked an allocation.
pub fn echo() -> String {
    module(
        r#"
        (data (i32.const 16) "echo")
        (func (export "run")
          (local $h i64)
          (call $assert_no_live)
          (local.set $h (call $read_input))
          (call $write_output (call $ptr (local.get $h)) (i32.sub (call $len (local.get $h)) (i32.const 1)))
          (call $write_diagnostic (i32.const 16) (i32.const 4)))
        "#,
    )
}

/// Writes the full guest-visible input range, terminator included.
pub fn framed() -> String {
    module(
        r#"
        (func (export "run")
          (local $h i64)
          (local.set $h (call $read_input))
          (call $write_output (call $ptr (local.get $h)) (call $len (local.get $h))))
        "#,
    )
}

/// Reads the input twice and reports whether the second read was empty.
pub fn double_read() -> String {
    module(
        r#"
        (data (i32.const 16) "consumed")
        (data (i32.const 32) "again")
        (func (export "run")
          (drop (call $read_input))
          (if (i64.eqz (call $read_input))
            (then (call $write_output (i32.const 16) (i32.const 8)))
            (else (call $write_output (i32.const 32) (i32.const 5)))))
        "#,
    )
}

/// Echoes `HTTP_METHOD` from the environment and notes on the diagnostic
/// stream whether `MISSING` resolved to the zero handle.
pub fn env_echo() -> String {
    module(
        r#"
        (data (i32.const 16) "HTTP_METHOD")
        (data (i32.const 32) "MISSING")
        (data (i32.const 48) "none")
        (data (i32.const 64) "missing-null")
        (func (export "run")
          (local $h i64)
          (local.set $h (call $read_env (i32.const 16) (i32.const 11)))
          (if (i64.eqz (local.get $h))
            (then (call $write_output (i32.const 48) (i32.const 4)))
            (else
              (call $write_output (call $ptr (local.get $h)) (i32.sub (call $len (local.get $h)) (i32.const 1)))))
          (if (i64.eqz (call $read_env (i32.const 32) (i32.const 7)))
            (then (call $write_diagnostic (i32.const 64) (i32.const 12)))))
        "#,
    )
}

/// Writes from an out-of-range pointer, then writes `ok`.
pub fn out_of_range() -> String {
    module(
        r#"
        (data (i32.const 16) "ok")
        (func (export "run")
          (call $write_output (i32.const -16) (i32.const 100))
          (call $write_diagnostic (i32.const 16) (i32.const -1))
          (call $write_output (i32.const 16) (i32.const 2)))
        "#,
    )
}

/// Consumes the input, writes a diagnostic, then hits `unreachable`.
pub fn trap_after_input() -> String {
    module(
        r#"
        (data (i32.const 16) "before trap")
        (func (export "run")
          (drop (call $read_input))
          (call $write_diagnostic (i32.const 16) (i32.const 11))
          unreachable)
        "#,
    )
}

/// Consumes the input, then loads from far outside linear memory.
pub fn out_of_bounds_load() -> String {
    module(
        r#"
        (func (export "run")
          (drop (call $read_input))
          (drop (i32.load (i32.const -16))))
        "#,
    )
}

/// Consumes the input, then loops forever.
pub fn spin() -> String {
    module(
        r#"
        (func (export "run")
          (drop (call $read_input))
          (loop $forever (br $forever)))
        "#,
    )
}

/// Writes `bye` then calls WASI `proc_exit(code)`.
pub fn exit_with(code: i32) -> String {
    module_with_imports(
        r#"(import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))"#,
        &format!(
            r#"
            (data (i32.const 16) "bye")
            (func (export "run")
              (drop (call $read_input))
              (call $write_output (i32.const 16) (i32.const 3))
              (call $proc_exit (i32.const {code})))
            "#
        ),
    )
}

/// Calls the host surface from its start function, before any call is
/// bound, and reports at call time what `read_input` returned then.
pub fn early_caller() -> String {
    module(
        r#"
        (global $early (mut i64) (i64.const -1))
        (data (i32.const 16) "unbound")
        (data (i32.const 32) "bound")
        (func $init
          (call $write_output (i32.const 16) (i32.const 7))
          (call $write_diagnostic (i32.const 16) (i32.const 7))
          (drop (call $read_env (i32.const 16) (i32.const 7)))
          (global.set $early (call $read_input)))
        (start $init)
        (func (export "run")
          (if (i64.eqz (global.get $early))
            (then (call $write_output (i32.const 16) (i32.const 7)))
            (else (call $write_output (i32.const 32) (i32.const 5)))))
        "#,
    )
}

/// A module whose `alloc` loads from outside linear memory. `run` notes
/// `started`, reads the input, then writes `started` to the output.
pub fn trapping_alloc() -> String {
    format!(
        r#"(module {IMPORTS}
          (memory (export "memory") 1)
          (data (i32.const 16) "started")
          (func (export "alloc") (param i32) (result i32) (i32.load (i32.const -16)))
          (func (export "free") (param i32))
          (func (export "run")
            (call $write_diagnostic (i32.const 16) (i32.const 7))
            (drop (call $read_input))
            (call $write_output (i32.const 16) (i32.const 7))))"#
    )
}

/// Writes `hi` to WASI stdout and `oops` to WASI stderr, and reports the
/// number of WASI environment variables as one digit via `write_diagnostic`.
pub fn wasi_stdio() -> String {
    module_with_imports(
        r#"
        (import "wasi_snapshot_preview1" "fd_write"
          (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "environ_sizes_get"
          (func $environ_sizes_get (param i32 i32) (result i32)))
        "#,
        r#"
        (data (i32.const 16) "hi")
        (data (i32.const 24) "oops")
        (func $print (param $fd i32) (param $ptr i32) (param $len i32)
          (i32.store (i32.const 100) (local.get $ptr))
          (i32.store (i32.const 104) (local.get $len))
          (drop (call $fd_write (local.get $fd) (i32.const 100) (i32.const 1) (i32.const 108))))
        (func (export "run")
          (call $print (i32.const 1) (i32.const 16) (i32.const 2))
          (call $print (i32.const 2) (i32.const 24) (i32.const 4))
          (drop (call $environ_sizes_get (i32.const 112) (i32.const 116)))
          (i32.store8 (i32.const 120) (i32.add (i32.const 48) (i32.load (i32.const 112))))
          (call $write_diagnostic (i32.const 120) (i32.const 1)))
        "#,
    )
}

/// A module whose `free` always traps.
pub fn failing_free() -> String {
    format!(
        r#"(module {IMPORTS}
          (memory (export "memory") 1)
          (func (export "alloc") (param i32) (result i32) (i32.const 4096))
          (func (export "free") (param i32) unreachable)
          (func (export "run")
            (local $h i64)
            (local.set $h (call $read_input))
            (call $write_output
              (i32.wrap_i64 (i64.shr_u (local.get $h) (i64.const 32)))
              (i32.sub (i32.wrap_i64 (local.get $h)) (i32.const 1)))))"#
    )
}

/// Echo built on the legacy `igets` / `oputs` / `eputs` import names.
pub fn legacy_echo() -> String {
    r#"(module
      (import "httpwasm" "igets" (func $igets (result i64)))
      (import "httpwasm" "oputs" (func $oputs (param i32 i32)))
      (import "httpwasm" "eputs" (func $eputs (param i32 i32)))
      (memory (export "memory") 1)
      (data (i32.const 16) "legacy")
      (func (export "malloc") (param i32) (result i32) (i32.const 4096))
      (func (export "free") (param i32))
      (func (export "run")
        (local $h i64)
        (local.set $h (call $igets))
        (call $oputs
          (i32.wrap_i64 (i64.shr_u (local.get $h) (i64.const 32)))
          (i32.sub (i32.wrap_i64 (local.get $h)) (i32.const 1)))
        (call $eputs (i32.const 16) (i32.const 6))))"#
        .to_string()
}

/// A module exporting only the named members of `alloc`, `free`, `run`.
pub fn exports_only(names: &[&str]) -> String {
    let mut body = String::from(r#"(memory (export "memory") 1)"#);
    for name in names {
        body.push_str(match *name {
            "alloc" => r#"(func (export "alloc") (param i32) (result i32) (i32.const 4096))"#,
            "free" => r#"(func (export "free") (param i32))"#,
            "run" => r#"(func (export "run"))"#,
            other => panic!("unknown export {other}"),
        });
    }
    format!("(module {body})")
}

/// A module whose start function traps.
pub fn trapping_start() -> String {
    r#"(module
      (memory (export "memory") 1)
      (func $boom unreachable)
      (start $boom)
      (func (export "alloc") (param i32) (result i32) (i32.const 4096))
      (func (export "free") (param i32))
      (func (export "run")))"#
        .to_string()
}

/// Checks that `"last":"<value>"` in the input is `Doe` and emits the
/// validation verdict as JSON.
pub fn validate() -> String {
    let pattern = r#""last":""#;
    let success = r#"{"status":"success","reason":{}}"#;
    let prefix = r#"{"status":"error","reason":{"code":1,"field":"name.last","value":""#;
    let suffix = r#"","description":"mismatched last name"}}"#;
    let plen = pattern.len();

    module(&format!(
        r#"
        (data (i32.const 16) "{pattern}")
        (data (i32.const 64) "{success}")
        (data (i32.const 256) "{prefix}")
        (data (i32.const 512) "{suffix}")

        (func $find (param $base i32) (param $len i32) (result i32)
          (local $i i32) (local $j i32)
          (block $notfound
            (loop $outer
              (br_if $notfound
                (i32.gt_u (i32.add (local.get $i) (i32.const {plen})) (local.get $len)))
              (local.set $j (i32.const 0))
              (block $mismatch
                (loop $inner
                  (if (i32.eq (local.get $j) (i32.const {plen}))
                    (then
                      (return
                        (i32.add (i32.add (local.get $base) (local.get $i)) (i32.const {plen})))))
                  (br_if $mismatch
                    (i32.ne
                      (i32.load8_u
                        (i32.add (i32.add (local.get $base) (local.get $i)) (local.get $j)))
                      (i32.load8_u (i32.add (i32.const 16) (local.get $j)))))
                  (local.set $j (i32.add (local.get $j) (i32.const 1)))
                  (br $inner)))
              (local.set $i (i32.add (local.get $i) (i32.const 1)))
              (br $outer)))
          (i32.const -1))

        (func (export "run")
          (local $h i64) (local $base i32) (local $len i32)
          (local $start i32) (local $end i32) (local $limit i32)
          (local.set $h (call $read_input))
          (local.set $base (call $ptr (local.get $h)))
          (local.set $len (call $len (local.get $h)))
          (local.set $start (call $find (local.get $base) (local.get $len)))
          (if (i32.eq (local.get $start) (i32.const -1))
            (then
              (local.set $start (i32.const 0))
              (local.set $end (i32.const 0)))
            (else
              (local.set $limit (i32.add (local.get $base) (local.get $len)))
              (local.set $end (local.get $start))
              (block $done
                (loop $scan
                  (br_if $done (i32.ge_u (local.get $end) (local.get $limit)))
                  (br_if $done (i32.eq (i32.load8_u (local.get $end)) (i32.const 34)))
                  (local.set $end (i32.add (local.get $end) (i32.const 1)))
                  (br $scan)))))
          (if (i32.and
                (i32.eq (i32.sub (local.get $end) (local.get $start)) (i32.const 3))
                (i32.and
                  (i32.eq (i32.load8_u (local.get $start)) (i32.const 68))
                  (i32.and
                    (i32.eq (i32.load8_u offset=1 (local.get $start)) (i32.const 111))
                    (i32.eq (i32.load8_u offset=2 (local.get $start)) (i32.const 101)))))
            (then
              (call $write_output (i32.const 64) (i32.const {success_len})))
            (else
              (call $write_output (i32.const 256) (i32.const {prefix_len}))
              (call $write_output
                (local.get $start) (i32.sub (local.get $end) (local.get $start)))
              (call $write_output (i32.const 512) (i32.const {suffix_len})))))
        "#,
        pattern = wat_str(pattern),
        success = wat_str(success),
        prefix = wat_str(prefix),
        suffix = wat_str(suffix),
        success_len = success.len(),
        prefix_len = prefix.len(),
        suffix_len = suffix.len(),
    ))
}
