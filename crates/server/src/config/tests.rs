use super::*;

use tether_core::SessionId;

#[test]
fn empty_file_uses_defaults() {
    let config: TetherConfig = toml::from_str("").unwrap();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.server.shutdown_timeout_seconds, 30);
    assert!(config.ui.enabled);
    assert_eq!(config.ui.dist_path, "ui/build");
    assert_eq!(config.store.backend, "memory");
    assert_eq!(config.store.bucket, "sessions");
    assert_eq!(config.store.chunk_size_bytes, 255 * 1024);
    assert_eq!(config.session.id, SessionId::default_id());
    assert_eq!(config.session.backup_interval_seconds, 300);
    assert!(config.session.restore_on_start);
    assert!(config.session.auto_init);
    assert_eq!(config.session.auto_init_delay_seconds, 2);
    assert_eq!(config.client.command, "tether-client");
    assert!(!config.telemetry.enabled);
    config.validate().unwrap();
}

#[test]
fn full_config_parses() {
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 3001

        [ui]
        enabled = false

        [store]
        backend = "postgres"
        url = "postgres://localhost/tether"
        schema = "messaging"
        table_prefix = "t_"
        bucket = "whatsapp"
        chunk_size_bytes = 1024
        ssl_mode = "require"

        [session]
        id = "main-device"
        data_path = "/var/lib/tether"
        backup_interval_seconds = 120
        restore_on_start = false

        [client]
        command = "node"
        args = ["client/index.js", "--headless"]

        [client.env]
        LOG_LEVEL = "debug"
    "#;

    let config: TetherConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 3001);
    assert!(!config.ui.enabled);
    assert_eq!(config.store.backend, "postgres");
    assert_eq!(
        config.store.resolved_url().as_deref(),
        Some("postgres://localhost/tether")
    );
    assert_eq!(config.store.schema, "messaging");
    assert_eq!(config.store.table_prefix, "t_");
    assert_eq!(config.store.bucket, "whatsapp");
    assert_eq!(config.store.chunk_size_bytes, 1024);
    assert_eq!(config.store.ssl_mode.as_deref(), Some("require"));
    assert_eq!(config.session.id.as_str(), "main-device");
    assert_eq!(config.session.backup_interval_seconds, 120);
    assert!(!config.session.restore_on_start);
    assert_eq!(config.client.command, "node");
    assert_eq!(config.client.args, vec!["client/index.js", "--headless"]);
    assert_eq!(config.client.env.get("LOG_LEVEL").unwrap(), "debug");
    config.validate().unwrap();
}

#[test]
fn invalid_session_id_is_rejected() {
    let result: Result<TetherConfig, _> = toml::from_str(
        r#"
        [session]
        id = "../escape"
    "#,
    );
    assert!(result.is_err());
}

#[test]
fn session_paths_derive_from_id() {
    let config: SessionConfig = toml::from_str(
        r#"
        id = "alpha"
        data_path = "/data"
    "#,
    )
    .unwrap();
    assert_eq!(config.archive_path(), std::path::PathBuf::from("/data/alpha.zip"));
    assert_eq!(
        config.profile_dir(),
        std::path::PathBuf::from("/data/session-alpha")
    );
    assert_eq!(config.backup_interval().as_secs(), 300);
}

#[test]
fn short_backup_interval_fails_validation() {
    let config: TetherConfig = toml::from_str(
        r"
        [session]
        backup_interval_seconds = 5
    ",
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("backup_interval_seconds"));
}

#[test]
fn zero_chunk_size_fails_validation() {
    let config: TetherConfig = toml::from_str(
        r"
        [store]
        chunk_size_bytes = 0
    ",
    )
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn empty_client_command_fails_validation() {
    let config: TetherConfig = toml::from_str(
        r#"
        [client]
        command = "  "
    "#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn telemetry_defaults() {
    let config: TelemetryConfig = toml::from_str("").unwrap();
    assert!(!config.enabled);
    assert_eq!(config.endpoint, "http://localhost:4317");
    assert_eq!(config.service_name, "tether");
    assert!((config.sample_ratio - 1.0).abs() < f64::EPSILON);
    assert_eq!(config.protocol, OtlpProtocol::Grpc);
    assert_eq!(config.log_filter, "info");
    assert_eq!(config.timeout_seconds, 10);
    assert!(config.resource_attributes.is_empty());
}

#[test]
fn telemetry_custom_config() {
    let toml = r#"
        enabled = true
        endpoint = "http://collector:4318"
        service_name = "tether-staging"
        sample_ratio = 0.5
        protocol = "http"
        log_filter = "warn,tether_server=debug"

        [resource_attributes]
        "deployment.environment" = "staging"
    "#;

    let config: TelemetryConfig = toml::from_str(toml).unwrap();
    assert!(config.enabled);
    assert_eq!(config.endpoint, "http://collector:4318");
    assert_eq!(config.service_name, "tether-staging");
    assert!((config.sample_ratio - 0.5).abs() < f64::EPSILON);
    assert_eq!(config.protocol, OtlpProtocol::Http);
    assert_eq!(config.log_filter, "warn,tether_server=debug");
    assert_eq!(
        config
            .resource_attributes
            .get("deployment.environment")
            .unwrap(),
        "staging"
    );
}

#[test]
fn unknown_telemetry_protocol_is_rejected() {
    let result: Result<TelemetryConfig, _> = toml::from_str(r#"protocol = "carrier-pigeon""#);
    assert!(result.is_err());
}

#[test]
fn out_of_range_sample_ratio_fails_validation() {
    let config: TetherConfig = toml::from_str(
        r"
        [telemetry]
        sample_ratio = 1.5
    ",
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("sample_ratio"));
}
