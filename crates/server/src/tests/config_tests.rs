use super::*;

fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = resolve_settings(&HashMap::new(), &HashMap::new());
    assert_eq!(settings, Settings::default());
}

#[test]
fn env_overrides_file_and_long_names_win() {
    let file_cfg = map(&[
        ("bind_addr", "0.0.0.0:9000"),
        ("database_url", "sqlite://file.db"),
        ("default_agent_name", "From File"),
    ]);
    let env = map(&[
        ("SERVER_BIND", "127.0.0.1:1111"),
        ("APP__BIND_ADDR", "127.0.0.1:2222"),
        ("DEFAULT_AGENT_MODEL", "gpt-test"),
        ("APP__MAX_BODY_BYTES", "1024"),
    ]);

    let settings = resolve_settings(&file_cfg, &env);
    assert_eq!(settings.server_bind, "127.0.0.1:2222");
    assert_eq!(settings.database_url, "sqlite://file.db");
    assert_eq!(settings.default_agent_name, "From File");
    assert_eq!(settings.default_agent_model, "gpt-test");
    assert_eq!(settings.max_body_bytes, 1024);
}

#[test]
fn unparsable_body_limit_is_ignored() {
    let settings = resolve_settings(&HashMap::new(), &map(&[("APP__MAX_BODY_BYTES", "lots")]));
    assert_eq!(settings.max_body_bytes, Settings::default().max_body_bytes);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn creates_parent_dir_for_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
