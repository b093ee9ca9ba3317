//! Configuration loading, cascade and validation.
//!
//! Sources are layered with the precedence flags > environment > config
//! file > defaults. The file is searched as `config.{yaml,yml,json,toml}`
//! in the working directory and `/etc/webdav/` unless an explicit path is
//! given; environment keys are `WD_<KEY>` with dots replaced by
//! underscores. Per-user entries inherit any of directory, permissions,
//! rules and rules-behavior they do not set themselves. The result is the
//! immutable [`Config`] the server runs on for its whole lifetime.

use std::env;
use std::path::{Path, PathBuf};

use config::{Environment, File};
use serde::Deserialize;

use crate::permissions::{Permissions, Rule, UserPermissions};
use crate::user::User;

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6065;
pub const DEFAULT_PREFIX: &str = "/";
pub const DEFAULT_CERT: &str = "cert.pem";
pub const DEFAULT_KEY: &str = "key.pem";

const CONFIG_DIRS: &[&str] = &[".", "/etc/webdav"];
const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "toml"];
const ENV_VALUE_PREFIX: &str = "{env}";

/// Immutable server image produced once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub tls: bool,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub prefix: String,
    pub debug: bool,
    pub no_sniff: bool,
    pub no_password: bool,
    pub behind_proxy: bool,
    /// Permission envelope of the anonymous default user, and the values
    /// user entries inherit.
    pub permissions: UserPermissions,
    pub log: LogConfig,
    pub cors: CorsConfig,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub format: LogFormat,
    pub colors: bool,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Console,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub credentials: bool,
    pub allowed_headers: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub exposed_headers: Vec<String>,
}

/// How a user's own `rules` combine with the global list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesBehavior {
    #[default]
    Overwrite,
    Append,
}

/// Flag-level overrides, applied on top of every other source.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: prefix must start with '/'")]
    InvalidPrefix,
    #[error("invalid config: {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("invalid config: cert must be defined if TLS is activated")]
    MissingCert,
    #[error("invalid config: key must be defined if TLS is activated")]
    MissingKey,
    #[error("invalid user: username must be set")]
    MissingUsername,
    #[error("invalid user {0:?}: password must be set")]
    MissingPassword(String),
    #[error("environment variable {0:?} is not set or empty")]
    EnvValue(String),
}

// The raw schema as it appears in files, the environment and overrides.
// The `config` crate normalizes keys to lowercase, so multi-word fields
// alias both the documented camelCase spelling and the lowercased one.
#[derive(Debug, Deserialize)]
struct RawConfig {
    address: String,
    port: u16,
    tls: bool,
    cert: String,
    key: String,
    prefix: String,
    debug: bool,
    #[serde(alias = "noSniff", alias = "nosniff")]
    no_sniff: bool,
    #[serde(alias = "noPassword", alias = "nopassword")]
    no_password: bool,
    #[serde(alias = "behindProxy", alias = "behindproxy")]
    behind_proxy: bool,
    directory: String,
    permissions: Permissions,
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(alias = "rulesBehavior", alias = "rulesbehavior")]
    rules_behavior: RulesBehavior,
    log: LogConfig,
    cors: CorsConfig,
    #[serde(default)]
    users: Vec<RawUser>,
}

// Unset fields inherit from the global config during the cascade.
#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    directory: Option<String>,
    permissions: Option<Permissions>,
    rules: Option<Vec<Rule>>,
    #[serde(
        default,
        alias = "rulesBehavior",
        alias = "rulesbehavior"
    )]
    rules_behavior: Option<RulesBehavior>,
}

/// Loads, cascades and validates the configuration.
pub fn parse_config(filename: Option<&Path>, overrides: &Overrides) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder()
        .set_default("address", DEFAULT_ADDRESS)?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("tls", false)?
        .set_default("cert", DEFAULT_CERT)?
        .set_default("key", DEFAULT_KEY)?
        .set_default("prefix", DEFAULT_PREFIX)?
        .set_default("debug", false)?
        .set_default("nosniff", false)?
        .set_default("nopassword", false)?
        .set_default("behindproxy", false)?
        .set_default("directory", ".")?
        .set_default("permissions", "R")?
        .set_default("rulesbehavior", "overwrite")?
        .set_default("log.format", "console")?
        .set_default("log.colors", true)?
        .set_default("log.outputs", vec!["stderr"])?
        .set_default("cors.enabled", false)?
        .set_default("cors.credentials", false)?
        .set_default("cors.allowed_headers", vec!["*"])?
        .set_default("cors.allowed_hosts", vec!["*"])?
        .set_default("cors.allowed_methods", vec!["*"])?
        .set_default("cors.exposed_headers", Vec::<String>::new())?;

    // An explicit file must exist; the searched locations are optional.
    let file = match filename {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };
    if let Some(path) = file {
        builder = builder.add_source(File::from(path));
    }

    builder = builder
        .add_source(
            Environment::with_prefix("WD")
                .separator("_")
                .ignore_empty(true)
                .try_parsing(true),
        )
        .set_override_option("address", overrides.address.clone())?
        .set_override_option("port", overrides.port.map(i64::from))?
        .set_override_option("tls", overrides.tls)?
        .set_override_option("cert", overrides.cert.clone())?
        .set_override_option("key", overrides.key.clone())?
        .set_override_option("prefix", overrides.prefix.clone())?;

    let raw: RawConfig = builder.build()?.try_deserialize()?;
    resolve(raw)
}

fn find_config_file() -> Option<PathBuf> {
    for dir in CONFIG_DIRS {
        for ext in CONFIG_EXTENSIONS {
            let candidate = Path::new(dir).join(format!("config.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

// Cascade user entries, resolve `{env}` indirections and validate. The
// only mutation beyond that is absolutizing paths.
fn resolve(raw: RawConfig) -> Result<Config, ConfigError> {
    if !raw.prefix.starts_with('/') {
        return Err(ConfigError::InvalidPrefix);
    }

    let (cert, key) = if raw.tls {
        if raw.cert.is_empty() {
            return Err(ConfigError::MissingCert);
        }
        if raw.key.is_empty() {
            return Err(ConfigError::MissingKey);
        }
        (
            std::path::absolute(&raw.cert)?,
            std::path::absolute(&raw.key)?,
        )
    } else {
        (PathBuf::from(&raw.cert), PathBuf::from(&raw.key))
    };

    let permissions = UserPermissions {
        directory: validate_directory(&raw.directory)?,
        permissions: raw.permissions,
        rules: raw.rules.clone(),
    };

    let mut users = Vec::with_capacity(raw.users.len());
    for entry in raw.users {
        let username = resolve_env_value(entry.username)?;
        if username.is_empty() {
            return Err(ConfigError::MissingUsername);
        }

        let password = resolve_env_value(entry.password)?;
        if password.is_empty() && !raw.no_password {
            return Err(ConfigError::MissingPassword(username));
        }

        let behavior = entry.rules_behavior.unwrap_or(raw.rules_behavior);
        let rules = match entry.rules {
            None => raw.rules.clone(),
            Some(own) => match behavior {
                RulesBehavior::Overwrite => own,
                RulesBehavior::Append => raw.rules.iter().cloned().chain(own).collect(),
            },
        };

        users.push(User {
            username,
            password,
            permissions: UserPermissions {
                directory: validate_directory(
                    entry.directory.as_deref().unwrap_or(&raw.directory),
                )?,
                permissions: entry.permissions.unwrap_or(raw.permissions),
                rules,
            },
        });
    }

    Ok(Config {
        address: raw.address,
        port: raw.port,
        tls: raw.tls,
        cert,
        key,
        prefix: raw.prefix,
        debug: raw.debug,
        no_sniff: raw.no_sniff,
        no_password: raw.no_password,
        behind_proxy: raw.behind_proxy,
        permissions,
        log: raw.log,
        cors: raw.cors,
        users,
    })
}

fn validate_directory(directory: &str) -> Result<PathBuf, ConfigError> {
    let absolute = std::path::absolute(directory)?;
    if !absolute.is_dir() {
        return Err(ConfigError::NotADirectory(absolute));
    }
    Ok(absolute)
}

// `{env}NAME` defers a value to the environment; an unset or empty
// variable fails validation.
fn resolve_env_value(value: String) -> Result<String, ConfigError> {
    let Some(name) = value.strip_prefix(ENV_VALUE_PREFIX) else {
        return Ok(value);
    };
    match env::var(name) {
        Ok(resolved) if !resolved.is_empty() => Ok(resolved),
        _ => Err(ConfigError::EnvValue(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Matcher;
    use std::sync::{Mutex, MutexGuard};

    // The process environment is shared between test threads; every test
    // that parses a config takes this lock so the WD_* tests cannot bleed
    // into the others.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_and_parse(content: &str, ext: &str) -> Result<Config, ConfigError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("config.{ext}"));
        std::fs::write(&path, content).unwrap();
        parse_config(Some(&path), &Overrides::default())
    }

    #[test]
    fn defaults() {
        let _env = env_lock();
        let cfg = write_and_parse("{}", "yml").unwrap();

        assert_eq!(cfg.address, DEFAULT_ADDRESS);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.prefix, DEFAULT_PREFIX);
        assert!(!cfg.tls);
        assert!(!cfg.debug);
        assert!(!cfg.no_sniff);
        assert!(!cfg.no_password);
        assert!(!cfg.behind_proxy);
        assert_eq!(cfg.permissions.permissions, Permissions::READ);
        assert!(cfg.permissions.directory.is_absolute());
        assert!(cfg.permissions.rules.is_empty());
        assert!(cfg.users.is_empty());

        assert_eq!(cfg.log.format, LogFormat::Console);
        assert!(cfg.log.colors);
        assert_eq!(cfg.log.outputs, vec!["stderr".to_string()]);

        assert!(!cfg.cors.enabled);
        assert_eq!(cfg.cors.allowed_headers, vec!["*".to_string()]);
        assert_eq!(cfg.cors.allowed_hosts, vec!["*".to_string()]);
        assert_eq!(cfg.cors.allowed_methods, vec!["*".to_string()]);
        assert!(cfg.cors.exposed_headers.is_empty());
    }

    #[test]
    fn cascade() {
        let _env = env_lock();
        let check = |cfg: &Config| {
            assert_eq!(cfg.permissions.permissions, Permissions::all());
            assert_eq!(cfg.permissions.rules.len(), 1);
            assert_eq!(cfg.users.len(), 2);

            // First user inherits everything.
            assert_eq!(cfg.users[0].permissions.permissions, Permissions::all());
            assert_eq!(cfg.users[0].permissions.rules.len(), 1);
            assert_eq!(
                cfg.users[0].permissions.directory,
                cfg.permissions.directory
            );

            // Second user overrides permissions and empties the rules.
            assert_eq!(cfg.users[1].permissions.permissions, Permissions::READ);
            assert!(cfg.users[1].permissions.rules.is_empty());
        };

        let yaml = r#"
permissions: CRUD
rules:
  - path: /public/
    permissions: R
users:
  - username: admin
    password: admin
  - username: basic
    password: basic
    permissions: R
    rules: []
"#;
        check(&write_and_parse(yaml, "yaml").unwrap());

        let json = r#"{
  "permissions": "CRUD",
  "rules": [{"path": "/public/", "permissions": "R"}],
  "users": [
    {"username": "admin", "password": "admin"},
    {"username": "basic", "password": "basic", "permissions": "R", "rules": []}
  ]
}"#;
        check(&write_and_parse(json, "json").unwrap());

        let toml = r#"
permissions = "CRUD"

[[rules]]
path = "/public/"
permissions = "R"

[[users]]
username = "admin"
password = "admin"

[[users]]
username = "basic"
password = "basic"
permissions = "R"
rules = []
"#;
        check(&write_and_parse(toml, "toml").unwrap());
    }

    #[test]
    fn rules_append_behavior() {
        let _env = env_lock();
        let yaml = r#"
permissions: CRUD
rules:
  - path: /public/
    permissions: R
users:
  - username: basic
    password: basic
    rulesBehavior: append
    rules:
      - path: /private/
        permissions: none
"#;
        let cfg = write_and_parse(yaml, "yml").unwrap();
        let rules = &cfg.users[0].permissions.rules;
        assert_eq!(rules.len(), 2);
        assert!(matches!(&rules[0].matcher, Matcher::Prefix(p) if p == "/public/"));
        assert!(matches!(&rules[1].matcher, Matcher::Prefix(p) if p == "/private/"));
    }

    #[test]
    fn rule_matchers() {
        let _env = env_lock();
        let yaml = r#"
rules:
  - regex: '^.+\.js$'
    permissions: R
  - path: /public/
    permissions: R
"#;
        let cfg = write_and_parse(yaml, "yaml").unwrap();
        let rules = &cfg.permissions.rules;
        assert_eq!(rules.len(), 2);
        assert!(rules[0].matches("/my/path/file.js"));
        assert!(!rules[0].matches("/my/path/file.ts"));
        assert!(rules[1].matches("/public/file.txt"));

        // Exactly one of path and regex must be set.
        assert!(write_and_parse(
            "rules:\n  - path: /a\n    regex: '^/a'\n    permissions: R\n",
            "yaml"
        )
        .is_err());
        assert!(write_and_parse("rules:\n  - permissions: R\n", "yaml").is_err());
    }

    #[test]
    fn cors_section() {
        let _env = env_lock();
        let yaml = r#"
cors:
  enabled: true
  credentials: true
  allowed_headers:
    - Depth
  allowed_hosts:
    - http://localhost:8080
  allowed_methods:
    - GET
  exposed_headers:
    - Content-Length
    - Content-Range
"#;
        let cfg = write_and_parse(yaml, "yml").unwrap();
        assert!(cfg.cors.enabled);
        assert!(cfg.cors.credentials);
        assert_eq!(cfg.cors.allowed_headers, vec!["Depth".to_string()]);
        assert_eq!(
            cfg.cors.allowed_hosts,
            vec!["http://localhost:8080".to_string()]
        );
        assert_eq!(cfg.cors.allowed_methods, vec!["GET".to_string()]);
        assert_eq!(
            cfg.cors.exposed_headers,
            vec!["Content-Length".to_string(), "Content-Range".to_string()]
        );
    }

    #[test]
    fn environment_overrides() {
        let _env = env_lock();
        env::set_var("WD_PORT", "1234");
        env::set_var("WD_PREFIX", "/test");
        env::set_var("WD_DEBUG", "true");

        let cfg = write_and_parse("{}", "yml").unwrap();
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.prefix, "/test");
        assert!(cfg.debug);

        env::remove_var("WD_PORT");
        env::remove_var("WD_PREFIX");
        env::remove_var("WD_DEBUG");
    }

    #[test]
    fn flag_overrides_win() {
        let _env = env_lock();
        let overrides = Overrides {
            port: Some(9999),
            prefix: Some("/dav".to_string()),
            ..Overrides::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: 1111\nprefix: /file\n").unwrap();

        let cfg = parse_config(Some(&path), &overrides).unwrap();
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.prefix, "/dav");
    }

    #[test]
    fn user_validation() {
        let _env = env_lock();
        assert!(matches!(
            write_and_parse("users:\n  - password: pw\n", "yaml"),
            Err(ConfigError::MissingUsername)
        ));
        assert!(matches!(
            write_and_parse("users:\n  - username: u\n", "yaml"),
            Err(ConfigError::MissingPassword(_))
        ));
        // Empty passwords are fine when the password check is disabled.
        assert!(
            write_and_parse("noPassword: true\nusers:\n  - username: u\n", "yaml").is_ok()
        );
    }

    #[test]
    fn env_indirection() {
        let _env = env_lock();
        env::set_var("TEST_WEBDAV_PASSWORD", "secret");
        let cfg = write_and_parse(
            "users:\n  - username: u\n    password: \"{env}TEST_WEBDAV_PASSWORD\"\n",
            "yaml",
        )
        .unwrap();
        assert_eq!(cfg.users[0].password, "secret");
        env::remove_var("TEST_WEBDAV_PASSWORD");

        assert!(matches!(
            write_and_parse(
                "users:\n  - username: u\n    password: \"{env}TEST_WEBDAV_UNSET\"\n",
                "yaml",
            ),
            Err(ConfigError::EnvValue(_))
        ));
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let _env = env_lock();
        assert!(matches!(
            write_and_parse("tls: true\ncert: \"\"\n", "yaml"),
            Err(ConfigError::MissingCert)
        ));
        assert!(matches!(
            write_and_parse("tls: true\nkey: \"\"\n", "yaml"),
            Err(ConfigError::MissingKey)
        ));

        let cfg = write_and_parse("tls: true\n", "yaml").unwrap();
        assert!(cfg.cert.is_absolute());
        assert!(cfg.key.is_absolute());
    }

    #[test]
    fn prefix_must_be_rooted() {
        let _env = env_lock();
        assert!(matches!(
            write_and_parse("prefix: dav\n", "yaml"),
            Err(ConfigError::InvalidPrefix)
        ));
    }

    #[test]
    fn directory_must_exist() {
        let _env = env_lock();
        assert!(matches!(
            write_and_parse("directory: /definitely/not/a/real/path\n", "yaml"),
            Err(ConfigError::NotADirectory(_))
        ));
    }
}
