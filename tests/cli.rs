use assert_cmd::Command;
use std::fs;

fn resemu() -> Command {
    Command::new(env!("CARGO_BIN_EXE_resemu"))
}

fn stderr_of(cmd: &mut Command) -> (bool, String) {
    let output = cmd.output().unwrap();
    (output.status.success(), String::from_utf8_lossy(&output.stderr).into_owned())
}

#[test]
fn runs_m68k_code_to_the_reset_sentinel() {
    let (ok, stderr) = stderr_of(resemu().args([
        "--mem",
        "1000/203C0000002A4E754E70",
        "--pc",
        "1000",
        "--push",
        "1008",
    ]));
    assert!(ok, "{stderr}");
    assert!(stderr.contains("---D0---"));
    assert!(stderr.lines().any(|line| line.starts_with("0000002A ")), "{stderr}");
    assert!(stderr.contains("0x2 instructions executed"));
}

#[test]
fn state_headers_can_be_suppressed() {
    let (ok, stderr) = stderr_of(resemu().args([
        "--mem",
        "1000/4E70",
        "--pc",
        "1000",
        "--no-state-headers",
    ]));
    assert!(ok, "{stderr}");
    assert!(!stderr.contains("---D0---"));
    assert!(stderr.contains("0x0 instructions executed"));
}

#[test]
fn trace_prints_every_instruction() {
    let (ok, stderr) = stderr_of(resemu().args([
        "--mem",
        "1000/700172024E70",
        "--pc",
        "1000",
        "--trace",
        "--no-state-headers",
    ]));
    assert!(ok, "{stderr}");
    assert!(stderr.contains("moveq"), "{stderr}");
    assert!(stderr.contains("0x2 instructions executed"));
}

#[test]
fn max_cycles_stops_a_loop() {
    let (ok, stderr) = stderr_of(resemu().args([
        "--mem",
        "1000/60FE",
        "--pc",
        "1000",
        "--max-cycles",
        "10",
    ]));
    assert!(ok, "{stderr}");
    assert!(stderr.contains("0x10 instructions executed"));
}

#[test]
fn illegal_instruction_fails_the_run() {
    let (ok, stderr) = stderr_of(resemu().args(["--mem", "1000/4AFC", "--pc", "1000"]));
    assert!(!ok);
    assert!(stderr.contains("Error: execution failed"), "{stderr}");
}

#[test]
fn tracing_data_sources_needs_x86() {
    let (ok, stderr) = stderr_of(resemu().args([
        "--arch",
        "ppc32",
        "--mem",
        "1000/60000000",
        "--pc",
        "1000",
        "--trace-data-sources",
    ]));
    assert!(!ok);
    assert!(stderr.contains("not supported for"), "{stderr}");
}

#[test]
fn overlapping_segments_are_reported() {
    let (ok, stderr) = stderr_of(resemu().args(["--mem", "1000:100", "--mem", "1080:10"]));
    assert!(!ok);
    assert!(stderr.contains("cannot place segment"), "{stderr}");
}

#[test]
fn unknown_registers_are_rejected() {
    let (ok, stderr) = stderr_of(resemu().args([
        "--mem",
        "1000/4E70",
        "--pc",
        "1000",
        "--reg",
        "q9:1",
    ]));
    assert!(!ok);
    assert!(stderr.contains("unknown register"), "{stderr}");
}

#[test]
fn saved_state_resumes_in_a_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("machine.state");
    let state_arg = state.to_str().unwrap();

    // moveq #7,d3; reset
    let (ok, stderr) = stderr_of(resemu().args([
        "--mem",
        "1000:10/76074E70",
        "--pc",
        "1000",
        "--save-state",
        state_arg,
    ]));
    assert!(ok, "{stderr}");
    assert!(fs::metadata(&state).unwrap().len() > 0);

    // addq.l #1,d3; reset
    let (ok, stderr) = stderr_of(resemu().args([
        "--load-state",
        state_arg,
        "--patch",
        "1004/52834E70",
        "--pc",
        "1004",
        "--no-state-headers",
    ]));
    assert!(ok, "{stderr}");
    assert!(stderr.contains("00000000 00000000 00000000 00000008 "), "{stderr}");
    assert!(stderr.contains("0x1 instructions executed"));
}

#[test]
fn loading_state_from_another_architecture_fails() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ppc.state");
    let state_arg = state.to_str().unwrap();

    let (ok, _) = stderr_of(resemu().args([
        "--arch",
        "ppc32",
        "--mem",
        "1000/3840FFFF44000002",
        "--pc",
        "1000",
        "--save-state",
        state_arg,
    ]));
    assert!(ok);

    let (ok, stderr) = stderr_of(resemu().args(["--load-state", state_arg]));
    assert!(!ok);
    assert!(stderr.contains("cannot be loaded into"), "{stderr}");
}

#[test]
fn x86_import_thunk_returns_thread_id() {
    // push 0x1020; push 0x1100; int 0xFF
    let (ok, stderr) = stderr_of(resemu().args([
        "--arch",
        "x86",
        "--mem",
        "1000/68201000006800110000CDFF",
        "--mem",
        "1100/6B65726E656C33322E646C6C3A47657443757272656E74546872656164496400",
        "--pc",
        "1000",
        "--max-cycles",
        "3",
        "--no-state-headers",
    ]));
    assert!(ok, "{stderr}");
    assert!(stderr.lines().any(|line| line.starts_with("EEEEEEEE ")), "{stderr}");
    assert!(stderr.contains("00001020 = "), "{stderr}");
}
