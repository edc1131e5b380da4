// tests/config_env.rs
// Mutates process env and CWD; serialized.

use std::{env, fs};

use cms_migrator::config::{ENV_AI_THRESHOLD, ENV_CONFIG_PATH, ENV_OUTPUT_DIR};
use cms_migrator::PipelineConfig;

/// Snapshot & restore env vars around a test.
struct EnvSnapshot {
    saved: Vec<(String, Option<String>)>,
}

impl EnvSnapshot {
    fn set(pairs: &[(&str, Option<&str>)]) -> Self {
        let mut saved = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            saved.push((k.to_string(), env::var(k).ok()));
            match v {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
        Self { saved }
    }
}

impl Drop for EnvSnapshot {
    fn drop(&mut self) {
        for (k, v) in self.saved.drain(..) {
            match v {
                Some(v) => env::set_var(&k, v),
                None => env::remove_var(&k),
            }
        }
    }
}

#[serial_test::serial]
#[test]
fn file_from_env_path_then_env_overrides() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("migrator.toml");
    fs::write(
        &path,
        r#"
[pipeline]
min_cluster_members = 3

[classifier]
threshold = 0.7

[output]
dir = "from_file"
"#,
    )
    .unwrap();
    let path_s = path.to_string_lossy().to_string();

    let _env = EnvSnapshot::set(&[
        (ENV_CONFIG_PATH, Some(path_s.as_str())),
        (ENV_AI_THRESHOLD, None),
        (ENV_OUTPUT_DIR, None),
    ]);
    let cfg = PipelineConfig::from_toml().unwrap();
    assert_eq!(cfg.pipeline.min_cluster_members, 3);
    assert!((cfg.classifier.threshold - 0.7).abs() < 1e-6);
    assert_eq!(cfg.output.dir, std::path::PathBuf::from("from_file"));

    let _over = EnvSnapshot::set(&[(ENV_AI_THRESHOLD, Some("1.9")), (ENV_OUTPUT_DIR, Some(" out2 "))]);
    let cfg = PipelineConfig::from_toml().unwrap();
    assert!((cfg.classifier.threshold - 1.0).abs() < 1e-6);
    assert_eq!(cfg.output.dir, std::path::PathBuf::from("out2"));
}

#[serial_test::serial]
#[test]
fn missing_file_gives_defaults() {
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();

    let _env = EnvSnapshot::set(&[
        (ENV_CONFIG_PATH, None),
        (ENV_AI_THRESHOLD, None),
        (ENV_OUTPUT_DIR, None),
    ]);
    let cfg = PipelineConfig::from_toml();

    env::set_current_dir(old).unwrap();
    let cfg = cfg.unwrap();
    assert_eq!(cfg.pipeline.parse_workers, 4);
    assert_eq!(cfg.schema.enum_cap, 10);
    assert_eq!(cfg.run_timeout(), Some(std::time::Duration::from_secs(600)));
}

#[serial_test::serial]
#[test]
fn broken_file_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("bad.toml");
    fs::write(&path, "[pipeline\nmin_cluster_members = ").unwrap();
    let path_s = path.to_string_lossy().to_string();
    let _env = EnvSnapshot::set(&[(ENV_CONFIG_PATH, Some(path_s.as_str()))]);
    assert!(PipelineConfig::from_toml().is_err());
}

#[serial_test::serial]
#[test]
fn mock_mode_selects_mock_client() {
    let _env = EnvSnapshot::set(&[("AI_TEST_MODE", Some("mock"))]);
    let client = cms_migrator::ai_adapter::build_client_from_config(&Default::default());
    assert!(client.is_enabled());
    assert_eq!(client.provider_name(), "mock");

    drop(_env);
    let _env = EnvSnapshot::set(&[("AI_TEST_MODE", None)]);
    let client = cms_migrator::ai_adapter::build_client_from_config(&Default::default());
    assert!(!client.is_enabled());
}
