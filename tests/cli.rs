use assert_cmd::Command;

fn tunixd() -> Command {
    Command::cargo_bin("tunixd").unwrap()
}

#[test]
fn get_mem_prints_used_percent() {
    let output = tunixd().arg("get-mem").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let value: f64 = stdout.trim().parse().expect("a single number");
    assert!((0.0..=100.0).contains(&value), "value = {value}");
    // One decimal place, per the output contract.
    assert!(stdout.trim().contains('.'));
}

#[test]
fn get_cpu_prints_total_percent() {
    let output = tunixd().arg("get-cpu").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let value: f64 = stdout.trim().parse().expect("a single number");
    assert!((0.0..=100.0).contains(&value), "value = {value}");
}

#[test]
fn unknown_argument_exits_with_two() {
    tunixd().arg("warp-speed").assert().code(2);
}

#[test]
fn malformed_config_file_exits_with_two() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.conf");
    std::fs::write(&path, "this line has no equals sign\n").unwrap();
    tunixd()
        .arg("--config")
        .arg(&path)
        .arg("get-mem")
        .assert()
        .code(2);
}

#[test]
fn missing_config_file_exits_with_two() {
    tunixd()
        .arg("--config")
        .arg("/no/such/file.conf")
        .arg("get-mem")
        .assert()
        .code(2);
}

#[test]
fn config_file_with_unknown_keys_still_works() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunixd.conf");
    std::fs::write(
        &path,
        "# comment\nlog_level = warning\nsome_future_knob = 42\n",
    )
    .unwrap();
    tunixd()
        .arg("--config")
        .arg(&path)
        .arg("get-mem")
        .assert()
        .success();
}
