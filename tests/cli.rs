use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const VALID: &str = r#"
exporter_port: 9100
metrics:
  - metric_name: aws_daily_cost_usd
    granularity: DAILY
    data_delay_days: 1
    metric_type: UnblendedCost
    group_by:
      enabled: true
      groups:
        - type: DIMENSION
          key: SERVICE
          label_name: service
target_aws_accounts:
  - account_id: "111111111111"
    assumed_role_name: cost-reader
    labels:
      env: prod
"#;

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_aws-cost-exporter")
}

fn write_config(dir: &TempDir, raw: &str) -> PathBuf {
    let path = dir.path().join("config.yaml");
    fs::write(&path, raw).expect("write config");
    path
}

fn run_cmd(config: &Path, args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .arg("--config")
        .arg(config)
        .env_remove("AWS_COST_EXPORTER_CONFIG")
        .output()
        .expect("run aws-cost-exporter command")
}

#[test]
fn check_config_prints_label_schema() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_config(&dir, VALID);

    let output = run_cmd(&config, &["check-config"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("metrics=1 accounts=1"));
    assert!(stdout.contains("aws_daily_cost_usd (DAILY) labels: account_id,env,charge_type,service"));
}

#[test]
fn check_config_requires_target_accounts() {
    let dir = TempDir::new().expect("temp dir");
    let cut = VALID.find("target_aws_accounts").expect("accounts block");
    let config = write_config(&dir, &VALID[..cut]);

    let output = run_cmd(&config, &["check-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("target_aws_accounts"));
}

#[test]
fn check_config_rejects_hourly_granularity() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_config(&dir, &VALID.replace("DAILY", "HOURLY"));

    let output = run_cmd(&config, &["check-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("HOURLY"));
}

#[test]
fn missing_config_file_fails() {
    let dir = TempDir::new().expect("temp dir");
    let output = run_cmd(&dir.path().join("absent.yaml"), &["check-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("absent.yaml"));
}
