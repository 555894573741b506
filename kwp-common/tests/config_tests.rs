//! Configuration resolution and write-back tests
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate KWP_* variables are marked with #[serial].

use kwp_common::config::{
    load_config, load_toml_config, resolve_config_path, write_toml_config, TomlConfig,
    ENV_CONFIG_PATH, ENV_MODEL, ENV_OLLAMA_URL,
};
use serial_test::serial;
use std::env;
use std::path::Path;
use tempfile::TempDir;

fn clear_env() {
    env::remove_var(ENV_CONFIG_PATH);
    env::remove_var(ENV_OLLAMA_URL);
    env::remove_var(ENV_MODEL);
}

#[test]
#[serial]
fn test_cli_argument_wins_over_env() {
    clear_env();
    env::set_var(ENV_CONFIG_PATH, "/tmp/from-env.toml");

    let resolved = resolve_config_path(Some(Path::new("/tmp/from-cli.toml")));
    assert_eq!(resolved.unwrap(), Path::new("/tmp/from-cli.toml"));

    clear_env();
}

#[test]
#[serial]
fn test_env_path_used_without_cli_argument() {
    clear_env();
    env::set_var(ENV_CONFIG_PATH, "/tmp/from-env.toml");

    let resolved = resolve_config_path(None);
    assert_eq!(resolved.unwrap(), Path::new("/tmp/from-env.toml"));

    clear_env();
}

#[test]
#[serial]
fn test_explicit_missing_file_is_error() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let result = load_config(Some(&missing));
    assert!(result.is_err(), "Explicitly named file must exist");
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [model]
        endpoint = "http://gpu-box:11434"
        preset = "llava"
        "#,
    )
    .unwrap();

    env::set_var(ENV_MODEL, "qwen3-vl:8b");
    let config = load_config(Some(&path)).unwrap();

    assert_eq!(config.model.endpoint, "http://gpu-box:11434");
    assert_eq!(config.model.preset, "qwen3-vl:8b", "ENV beats TOML");

    clear_env();
}

#[test]
#[serial]
fn test_blank_env_values_are_ignored() {
    clear_env();
    env::set_var(ENV_OLLAMA_URL, "   ");

    let mut config = TomlConfig::default();
    config.apply_env_overrides();
    assert_eq!(config.model.endpoint, "http://localhost:11434");

    clear_env();
}

#[test]
fn test_write_then_load_preserves_values() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("config.toml");

    let mut config = TomlConfig::default();
    config.engine.worker_limit = 4;
    config.engine.distance_km = 12.5;
    config
        .engine
        .synonyms
        .insert("car".to_string(), vec!["automobile".to_string()]);

    write_toml_config(&config, &path).unwrap();
    assert!(path.exists());
    assert!(
        !path.with_extension("toml.tmp").exists(),
        "Temp file should be renamed away"
    );

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_malformed_toml_reports_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "[engine\nworker_limit = ").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}
