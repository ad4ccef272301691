//! End-to-end smoke test: a server config with an unreachable ACME
//! directory should fail fast with a clear, non-panicking error rather
//! than hang or crash the process.

use std::io::Write;
use std::process::Command;

fn write_temp_config(contents: &str, suffix: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("certdx-test-{}-{}.toml", std::process::id(), suffix));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn server_rejects_config_missing_allowed_domains() {
    let config = write_temp_config(
        r#"
[acme]
email = "ops@example.com"
provider = "letsencrypt-test"

[http]
enabled = true
"#,
        "server-invalid",
    );

    let bin_path = env!("CARGO_BIN_EXE_certdx");
    let output = Command::new(bin_path)
        .arg("server")
        .arg("--conf")
        .arg(&config)
        .output()
        .expect("failed to run certdx binary");

    std::fs::remove_file(&config).ok();

    assert!(!output.status.success(), "server should reject a config with no allowed_domains");
}

#[test]
fn client_test_flag_validates_without_connecting() {
    let config = write_temp_config(
        r#"
[common]
mode = "http"

[http.main]
url = "https://127.0.0.1:1/"

[[certs]]
name = "web"
domains = ["example.com"]
save_path = "/tmp/certdx-test-certs"
"#,
        "client-valid",
    );

    let bin_path = env!("CARGO_BIN_EXE_certdx");
    let output = Command::new(bin_path)
        .arg("client")
        .arg("--conf")
        .arg(&config)
        .arg("--test")
        .output()
        .expect("failed to run certdx binary");

    std::fs::remove_file(&config).ok();

    assert!(output.status.success(), "valid config with --test should exit 0 without connecting to any server");
}

#[test]
fn verify_help_output() {
    let bin_path = env!("CARGO_BIN_EXE_certdx");
    let output = Command::new(bin_path).arg("--help").output().expect("failed to run certdx binary");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("server"));
    assert!(text.contains("client"));
}
