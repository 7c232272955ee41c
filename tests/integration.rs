use datatest_stable as datatest;
use std::{
    fs,
    path::Path,
    process::{Command, Output, Stdio},
};

struct Expectation {
    status: i32,
    fragments: Vec<String>,
}

/// Each `NAME.args` file holds the command line for one run; `NAME.expected`
/// lists lines that must appear somewhere in stderr. An optional
/// `status: N` line sets the expected exit code.
fn load_expectation(path: &Path) -> Expectation {
    let text = fs::read_to_string(path.with_extension("expected")).unwrap_or_default();
    let mut expectation = Expectation {
        status: 0,
        fragments: Vec::new(),
    };
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        match line.strip_prefix("status:") {
            Some(code) => expectation.status = code.trim().parse().unwrap(),
            None => expectation.fragments.push(line.to_string()),
        }
    }
    expectation
}

fn run_emulator(path: &Path) -> std::io::Result<Output> {
    let text = fs::read_to_string(path)?;
    let args = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace);
    Command::new(env!("CARGO_BIN_EXE_resemu"))
        .args(args)
        .current_dir(path.parent().unwrap())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
}

fn run_case(path: &Path) -> datatest::Result<()> {
    let expectation = load_expectation(path);
    let output = run_emulator(path)?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    let status = output.status.code().unwrap_or(-1);
    if status != expectation.status {
        panic!(
            "{} exited with {status}, expected {}\nstderr: {stderr}",
            path.display(),
            expectation.status
        );
    }
    for fragment in &expectation.fragments {
        if !stderr.contains(fragment.as_str()) {
            panic!("{}: missing {fragment:?}\nstderr: {stderr}", path.display());
        }
    }
    Ok(())
}

datatest::harness! {
    { test = run_case, root = "tests/programs", pattern = r#"^.*\.args$"# },
}
