use dsms_sdk::config::Configuration;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

const OVERRIDES: [&str; 5] = [
    "DSMS_HOST_URL",
    "DSMS_TOKEN",
    "DSMS_REQUEST_TIMEOUT",
    "DSMS_SSL_VERIFY",
    "DSMS_LOG_LEVEL",
];

fn clear_env() {
    for name in OVERRIDES {
        env::remove_var(name);
    }
}

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("dsms.config.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_from_file_fills_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(
        &temp_dir,
        r#"
host_url = "https://dsms.example.org"
token = "abc"
strict_validation = false
"#,
    );

    let config = Configuration::load_from_file(&path).unwrap();
    assert_eq!(config.host_url, "https://dsms.example.org");
    assert!(!config.strict_validation);
    assert_eq!(config.request_timeout, 120);
    assert!(config.auto_refresh);
    assert!(config.individual_slugs);
    assert_eq!(config.kitem_repo, "knowledge-items");
    assert_eq!(config.logging.level, "info");
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_missing_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let err = Configuration::load_from_file(&temp_dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_invalid_host_is_rejected() {
    let config = Configuration::new("dsms.example.org");
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("http://"));
}

#[test]
fn test_credentials_and_token_are_exclusive() {
    let config = Configuration::new("https://dsms.example.org")
        .with_credentials("alice", "secret")
        .with_token("abc");
    assert!(config.validate().is_err());

    let mut config = Configuration::new("https://dsms.example.org");
    config.username = Some("alice".to_string());
    assert!(config.validate().is_err());
}

#[test]
fn test_secrets_are_masked_in_debug_output() {
    let config = Configuration::new("https://dsms.example.org").with_credentials("alice", "secret");
    let printed = format!("{:?}", config);
    assert!(printed.contains("alice"));
    assert!(!printed.contains("secret"));
}

#[test]
#[serial]
fn test_env_overrides_take_precedence() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(
        &temp_dir,
        r#"
host_url = "https://dsms.example.org"
request_timeout = 30
"#,
    );

    env::set_var("DSMS_HOST_URL", "https://other.example.org");
    env::set_var("DSMS_TOKEN", "from-env");
    env::set_var("DSMS_REQUEST_TIMEOUT", "5");
    env::set_var("DSMS_SSL_VERIFY", "False");
    env::set_var("DSMS_LOG_LEVEL", "DEBUG");

    let mut config = Configuration::load_from_file(&path).unwrap();
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.host_url, "https://other.example.org");
    assert_eq!(config.bearer().as_deref(), Some("Bearer from-env"));
    assert_eq!(config.request_timeout, 5);
    assert!(!config.ssl_verify);
    assert_eq!(config.logging.level, "debug");
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_unparseable_env_values_are_ignored() {
    clear_env();
    env::set_var("DSMS_REQUEST_TIMEOUT", "soon");
    env::set_var("DSMS_SSL_VERIFY", "maybe");

    let mut config = Configuration::new("https://dsms.example.org");
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.request_timeout, 120);
    assert!(config.ssl_verify);
}

#[test]
fn test_endpoint_joins_without_double_slash() {
    let config = Configuration::new("https://dsms.example.org/");
    assert_eq!(
        config.endpoint("/api/knowledge/kitems"),
        "https://dsms.example.org/api/knowledge/kitems"
    );
}
