use std::process::Command;

#[test]
fn prints_trace_in_switch_order() {
    let output = Command::new(env!("CARGO_BIN_EXE_coswitch")).output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(
        stdout.lines().collect::<Vec<_>>(),
        ["Worker1 start", "Worker2 start", "Worker1 end", "Worker2 end", "main end"]
    );
}

#[test]
fn ignores_arguments() {
    let output = Command::new(env!("CARGO_BIN_EXE_coswitch"))
        .arg("--unused")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap().lines().count(), 5);
}
