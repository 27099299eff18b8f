use std::process::Command;

#[test]
fn test_rampd_version_flag() {
    let output = Command::new(env!("CARGO_BIN_EXE_rampd"))
        .arg("--version")
        .output()
        .expect("Failed to run rampd --version");

    assert!(output.status.success(), "rampd --version failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.trim().is_empty(), "Expected version output");
}

#[test]
fn test_rampd_help_lists_flags() {
    let output = Command::new(env!("CARGO_BIN_EXE_rampd"))
        .arg("--help")
        .output()
        .expect("Failed to run rampd --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--socket"));
    assert!(stdout.contains("--data-dir"));
}
