use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use crate::config::PostgresConfig;

/// Build `PgConnectOptions` from a [`PostgresConfig`], applying SSL settings
/// when configured.
///
/// # Errors
///
/// Returns [`sqlx::Error::Configuration`] if the URL or `ssl_mode` is invalid.
pub fn build_connect_options(config: &PostgresConfig) -> Result<PgConnectOptions, sqlx::Error> {
    let mut options: PgConnectOptions = config.url.parse()?;

    if let Some(ref mode) = config.ssl_mode {
        let ssl_mode = match mode.as_str() {
            "disable" => PgSslMode::Disable,
            "prefer" => PgSslMode::Prefer,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            other => {
                return Err(sqlx::Error::Configuration(
                    format!("unknown ssl_mode: {other}").into(),
                ));
            }
        };
        options = options.ssl_mode(ssl_mode);
    }

    if let Some(ref path) = config.ssl_root_cert {
        options = options.ssl_root_cert(path);
    }

    if let Some(ref path) = config.ssl_cert {
        options = options.ssl_client_cert(path);
    }

    if let Some(ref path) = config.ssl_key {
        options = options.ssl_client_key(path);
    }

    Ok(options)
}

/// Create the process-wide pool without connecting.
///
/// Connections are opened on first use, so a database that is down at
/// startup surfaces as failed store operations rather than a boot failure.
///
/// # Errors
///
/// Returns an error if the connection options are invalid.
pub fn connect_lazy(config: &PostgresConfig) -> Result<PgPool, sqlx::Error> {
    let options = build_connect_options(config)?;
    Ok(PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect_lazy_with(options))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_ssl_mode() {
        let cfg = PostgresConfig {
            ssl_mode: Some("sometimes".into()),
            ..PostgresConfig::default()
        };
        let err = build_connect_options(&cfg).unwrap_err();
        assert!(err.to_string().contains("unknown ssl_mode"));
    }

    #[test]
    fn accepts_known_ssl_modes() {
        for mode in ["disable", "prefer", "require", "verify-ca", "verify-full"] {
            let cfg = PostgresConfig {
                ssl_mode: Some(mode.into()),
                ..PostgresConfig::default()
            };
            assert!(build_connect_options(&cfg).is_ok(), "mode {mode} should parse");
        }
    }

    #[test]
    fn rejects_malformed_url() {
        let cfg = PostgresConfig {
            url: "not a url".into(),
            ..PostgresConfig::default()
        };
        assert!(build_connect_options(&cfg).is_err());
    }

    #[tokio::test]
    async fn lazy_pool_does_not_connect() {
        let cfg = PostgresConfig {
            url: "postgres://nobody@127.0.0.1:1/nothing".into(),
            ..PostgresConfig::default()
        };
        let pool = connect_lazy(&cfg).expect("lazy pool should build");
        assert_eq!(pool.size(), 0);
    }
}
