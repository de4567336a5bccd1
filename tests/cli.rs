use std::fs;
use std::process::Command;

use damds::distances::encode;
use tempfile::tempdir;

#[test]
fn template_then_run_writes_points() {
    let tmp = tempdir().expect("temporary directory");
    let matrix_path = tmp.path().join("dist.bin");
    let line = [
        0.0, 1.0, 2.0, 3.0, //
        1.0, 0.0, 1.0, 2.0, //
        2.0, 1.0, 0.0, 1.0, //
        3.0, 2.0, 1.0, 0.0,
    ];
    let bytes: Vec<u8> = line
        .iter()
        .flat_map(|d: &f64| encode(d / 3.0).to_be_bytes())
        .collect();
    fs::write(&matrix_path, bytes).expect("write matrix");

    let exe = env!("CARGO_BIN_EXE_damds");
    let config_path = tmp.path().join("run.toml");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "template",
            "--points",
            "4",
            "--dim",
            "2",
            "--distances",
            matrix_path.to_str().expect("path str"),
            "-o",
            config_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run damds template");
    assert!(status.success(), "template exited with status {status:?}");
    assert!(config_path.exists(), "run.toml missing");

    let points_path = tmp.path().join("points.txt");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "run",
            config_path.to_str().expect("path str"),
            "--threads",
            "2",
            "--processes",
            "2",
            "--region-dir",
            tmp.path().to_str().expect("path str"),
            "-o",
            points_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run damds");
    assert!(status.success(), "run exited with status {status:?}");

    let text = fs::read_to_string(&points_path).expect("points file");
    assert_eq!(text.lines().count(), 4);
    assert!(tmp.path().join("damds-node0.region").is_file());
}

#[test]
fn missing_config_fails_with_a_message() {
    let tmp = tempdir().expect("temporary directory");
    let output = Command::new(env!("CARGO_BIN_EXE_damds"))
        .current_dir(tmp.path())
        .args(["run", "absent.toml"])
        .output()
        .expect("run damds");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
}
