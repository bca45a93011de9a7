use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use minicil::il::op;
use minicil::metadata::{IlEmitter, ImageBuilder, MethodSignature};

struct Output {
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

fn program_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("programs")
        .join(name)
}

fn minicil(args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_minicil"))
        .args(args)
        .output()
        .expect("failed to execute minicil");

    Output {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        code: output.status.code(),
    }
}

fn run_program(name: &str, extra: &[&str]) -> Output {
    let path = program_path(name);
    let mut args = vec!["run", path.to_str().unwrap()];
    args.extend_from_slice(extra);
    minicil(&args)
}

fn assert_exit(output: &Output, code: i32) {
    assert_eq!(output.code, Some(code), "stderr:\n{}", output.stderr);
}

fn assert_failure(output: &Output) -> &str {
    assert_eq!(output.code, Some(1), "program should fail, stdout:\n{}", output.stdout);
    &output.stderr
}

#[test]
fn test_exit_code_is_entry_point_result() {
    assert_exit(&run_program("add.toml", &[]), 5);
    assert_exit(&run_program("fields.toml", &[]), 42);
    assert_exit(&run_program("dispatch.toml", &[]), 7);
    assert_exit(&run_program("factorial.toml", &[]), 120);
}

#[test]
fn test_json_program() {
    assert_exit(&run_program("add.json", &[]), 42);
}

#[test]
fn test_console_output() {
    let output = run_program("hello.toml", &[]);
    assert_exit(&output, 0);
    assert_eq!(output.stdout, "Hello, world!\n");
}

#[test]
fn test_caught_null_reference() {
    let output = run_program("null_catch.toml", &[]);
    assert_exit(&output, 0);
    assert_eq!(output.stdout, "");
}

#[test]
fn test_unhandled_fault_is_reported() {
    let output = run_program("divide_escape.toml", &[]);
    let stderr = assert_failure(&output);
    assert!(stderr.starts_with("error: "), "{}", stderr);
    assert!(stderr.contains("divide by zero"), "{}", stderr);
}

#[test]
fn test_max_call_depth_flag() {
    let output = run_program("factorial.toml", &["--max-call-depth", "4"]);
    let stderr = assert_failure(&output);
    assert!(stderr.contains("call depth limit of 4 exceeded"), "{}", stderr);
}

#[test]
fn test_config_file() {
    let mut config = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(config, "max_call_depth = 3").unwrap();
    let config_path = config.path().to_str().unwrap().to_string();

    let output = run_program("factorial.toml", &["--config", &config_path]);
    assert_failure(&output);

    // flags override the file
    let output = run_program("factorial.toml", &["--config", &config_path, "--max-call-depth", "64"]);
    assert_exit(&output, 120);
}

#[test]
fn test_invalid_config_file() {
    let mut config = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(config, "jit = true").unwrap();
    let output = run_program("add.toml", &["--config", config.path().to_str().unwrap()]);
    let stderr = assert_failure(&output);
    assert!(stderr.contains("invalid config"), "{}", stderr);
}

#[test]
fn test_gc_stats() {
    let output = run_program("fields.toml", &["--gc-stats"]);
    assert_exit(&output, 42);
    assert!(output.stderr.contains("[GC] Allocated: 1, Minor: 2"), "{}", output.stderr);

    let output = run_program("fields.toml", &["--gc-stats", "--no-gc"]);
    assert_exit(&output, 42);
    assert!(output.stderr.contains("Minor: 0"), "{}", output.stderr);
}

#[test]
fn test_verify_flag_rejects_bad_branch() {
    let stderr = assert_failure(&run_program("bad_branch.toml", &["--verify"])).to_string();
    assert!(stderr.contains("invalid branch target IL_0003 from IL_0000"), "{}", stderr);
}

#[test]
fn test_check_command() {
    let path = program_path("dispatch.toml");
    let output = minicil(&["check", path.to_str().unwrap()]);
    assert_exit(&output, 0);
    assert_eq!(output.stdout, "7 method bodies verified.\n");

    let path = program_path("bad_branch.toml");
    let output = minicil(&["check", path.to_str().unwrap()]);
    let stderr = assert_failure(&output);
    assert!(stderr.contains("invalid branch target"), "{}", stderr);
}

#[test]
fn test_missing_file() {
    let output = minicil(&["run", "does/not/exist.toml"]);
    let stderr = assert_failure(&output);
    assert!(stderr.starts_with("error: "), "{}", stderr);
}

#[test]
fn test_builder_image_with_arguments() {
    // Main(string[] args) prints its argument list and returns nothing
    let mut b = ImageBuilder::new();
    let program = b.type_def("", "Program");
    let main = b.method(program, "Main", MethodSignature::new(1, false, true));
    let console = b.type_ref("System", "Console");
    let write_line = b.member_ref(console, "WriteLine", Some(MethodSignature::new(1, false, true)));
    let mut il = IlEmitter::new();
    il.ldarg(0).call(write_line).op(op::RET);
    b.body(main, 0, il).unwrap().entry_point(main);
    let text = b.build().to_toml_string().unwrap();

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let output = minicil(&["run", &path, "--", "alpha", "beta"]);
    assert_exit(&output, 0);
    assert_eq!(output.stdout, "System.String[]\n");
}

#[test]
fn test_exit_code_keeps_low_byte() {
    let mut b = ImageBuilder::new();
    let program = b.type_def("", "Program");
    let main = b.method(program, "Main", MethodSignature::new(0, false, false));
    let mut il = IlEmitter::new();
    il.ldc_i4(300).op(op::RET);
    b.body(main, 0, il).unwrap().entry_point(main);
    let text = b.build().to_toml_string().unwrap();

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_string();

    assert_exit(&minicil(&["run", &path]), 300 % 256);
}
