//! Server configuration.
//!
//! A JSON object declaring named prefixes and their handlers:
//!
//! ```json
//! {
//!   "password": ["_env", "LARCH_PASSWORD"],
//!   "prefixes": {
//!     "/bs/": {
//!       "handler": "storage-localdisk",
//!       "handlerArgs": { "path": "/var/lib/larch/blobs" }
//!     }
//!   }
//! }
//! ```
//!
//! `["_env", "NAME"]` expressions anywhere in the tree are replaced by
//! the named environment variable during load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use larch_core::Error;
use larch_core::Result;

/// One prefix entry: the handler type and its arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefixConfig {
    pub handler: String,
    #[serde(rename = "handlerArgs", default)]
    pub handler_args: Value,
}

/// Top-level server configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub prefixes: BTreeMap<String, PrefixConfig>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(rename = "baseURL", default)]
    pub base_url: Option<String>,
    #[serde(rename = "TLSCertFile", default)]
    pub tls_cert_file: Option<String>,
    #[serde(rename = "TLSKeyFile", default)]
    pub tls_key_file: Option<String>,
    #[serde(default)]
    pub listen: Option<String>,
}

/// Read and parse the configuration file.
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("error opening {}: {e}", path.display())))?;
    parse_config(&data)
}

/// Parse configuration JSON, expanding `["_env", ...]` expressions.
pub fn parse_config(data: &str) -> Result<ServerConfig> {
    let mut value: Value = serde_json::from_str(data)
        .map_err(|e| Error::config(format!("error parsing JSON config: {e}")))?;
    expand_expressions(&mut value)?;
    let config: ServerConfig = serde_json::from_value(value)
        .map_err(|e| Error::config(format!("invalid config structure: {e}")))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ServerConfig) -> Result<()> {
    for prefix in config.prefixes.keys() {
        if !prefix.starts_with('/') {
            return Err(Error::config(format!("prefix {prefix:?} doesn't start with /")));
        }
        if !prefix.ends_with('/') {
            return Err(Error::config(format!("prefix {prefix:?} doesn't end with /")));
        }
    }
    if config.tls_cert_file.is_some() != config.tls_key_file.is_some() {
        return Err(Error::config(
            "TLSCertFile and TLSKeyFile must both be either present or absent",
        ));
    }
    Ok(())
}

/// Replace `["_env", "NAME"]` arrays with the environment variable's
/// value, recursively.
pub fn expand_expressions(value: &mut Value) -> Result<()> {
    match value {
        Value::Array(items) if is_env_expression(items) => {
            let Value::String(name) = &items[1] else {
                return Err(Error::config("_env expression takes a string name"));
            };
            let expanded = std::env::var(name)
                .map_err(|_| Error::config(format!("config references unset ${name}")))?;
            *value = Value::String(expanded);
        }
        Value::Array(items) => {
            for item in items {
                expand_expressions(item)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                expand_expressions(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn is_env_expression(items: &[Value]) -> bool {
    items.len() == 2 && items[0] == Value::String("_env".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config = parse_config(
            r#"{
                "prefixes": {
                    "/bs/": {"handler": "storage-memory"}
                }
            }"#,
        )
        .expect("parse");
        assert_eq!(config.prefixes.len(), 1);
        assert_eq!(config.prefixes["/bs/"].handler, "storage-memory");
        assert!(config.password.is_none());
    }

    #[test]
    fn expands_env_expressions() {
        std::env::set_var("LARCH_TEST_SECRET", "hunter2");
        let config = parse_config(
            r#"{
                "password": ["_env", "LARCH_TEST_SECRET"],
                "prefixes": {}
            }"#,
        )
        .expect("parse");
        assert_eq!(config.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn unset_env_is_a_config_error() {
        let err = parse_config(
            r#"{
                "password": ["_env", "LARCH_TEST_DEFINITELY_UNSET"],
                "prefixes": {}
            }"#,
        )
        .expect_err("unset var");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn rejects_bad_prefixes() {
        for bad in ["bs/", "/bs"] {
            let err = parse_config(&format!(
                r#"{{"prefixes": {{"{bad}": {{"handler": "storage-memory"}}}}}}"#
            ))
            .expect_err("bad prefix");
            assert!(matches!(err, Error::Config { .. }), "{bad}");
        }
    }

    #[test]
    fn rejects_unpaired_tls_files() {
        let err = parse_config(
            r#"{"TLSCertFile": "cert.pem", "prefixes": {}}"#,
        )
        .expect_err("unpaired TLS");
        assert!(matches!(err, Error::Config { .. }));
    }
}
