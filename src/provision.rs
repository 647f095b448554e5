//! `add-auth`: offline provisioning of challenge-response credentials.
//!
//! The config file is edited as a plain TOML table so that everything else in
//! it is written back as found.

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing::info;

use crate::auth::crypto::{SALT_LEN, random_salt, salted_hash};

#[derive(Args, Debug, Clone)]
pub struct AddAuthArgs {
    /// Name of the authentication configuration to add
    #[arg(short, long)]
    pub name: String,

    /// Username clients log in with
    #[arg(short, long)]
    pub username: String,

    /// Plaintext password; only its salted hash is stored
    #[arg(short, long)]
    pub password: String,

    /// Authentication timeout in milliseconds (0 disables it)
    #[arg(short, long, default_value_t = 5000)]
    pub timeout: u64,
}

/// What was written, for echoing back to the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    pub name: String,
    pub username: String,
    pub timeout: u64,
    pub salt: String,
    pub password_hash: String,
}

impl std::fmt::Display for Provisioned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "New auth: {}", self.name)?;
        writeln!(f, "  type: challenge-response")?;
        writeln!(f, "  timeout: {}", self.timeout)?;
        writeln!(f, "  username: {}", self.username)?;
        writeln!(f, "  salt: {}", self.salt)?;
        write!(f, "  SHA512(salt + password): {}", self.password_hash)
    }
}

/// Add a `challenge-response` entry to the config at `path`. An existing entry
/// with the same name is never replaced.
pub fn add_auth(path: &Path, args: &AddAuthArgs) -> Result<Provisioned> {
    if args.name.trim().is_empty() {
        bail!("Authentication configuration name must not be empty");
    }
    if args.username.trim().is_empty() || args.password.is_empty() {
        bail!("Username and password must not be empty");
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    let auth = config
        .entry("auth")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let Some(auth) = auth.as_table_mut() else {
        bail!("`auth` in {} is not a table", path.display());
    };
    if auth.contains_key(&args.name) {
        bail!("Authentication configuration {} already exists", args.name);
    }

    let salt = random_salt(SALT_LEN);
    let password_hash = salted_hash(&salt, &args.password);
    let timeout = i64::try_from(args.timeout).context("Timeout out of range")?;

    let mut entry = toml::Table::new();
    entry.insert("type".into(), toml::Value::String("challenge-response".into()));
    entry.insert("timeout".into(), toml::Value::Integer(timeout));
    entry.insert("username".into(), toml::Value::String(args.username.clone()));
    entry.insert("password".into(), toml::Value::String(password_hash.clone()));
    entry.insert("salt".into(), toml::Value::String(salt.clone()));
    auth.insert(args.name.clone(), toml::Value::Table(entry));

    let content = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    info!("Saved auth {} to {}", args.name, path.display());

    Ok(Provisioned {
        name: args.name.clone(),
        username: args.username.clone(),
        timeout: args.timeout,
        salt,
        password_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::config::GatewayConfig;
    use std::io::Write;

    fn args(name: &str) -> AddAuthArgs {
        AddAuthArgs {
            name: name.to_string(),
            username: "ops".to_string(),
            password: "hunter2".to_string(),
            timeout: 5000,
        }
    }

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_adds_loadable_entry() {
        let file = config_file("port = 9000\n");
        let created = add_auth(file.path(), &args("salty")).unwrap();

        assert_eq!(created.salt.chars().count(), SALT_LEN);
        assert_eq!(created.password_hash, salted_hash(&created.salt, "hunter2"));

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        let entry = &config.auth["salty"];
        assert_eq!(entry.kind, "challenge-response");
        assert_eq!(entry.options["salt"].as_str(), Some(created.salt.as_str()));
        assert_eq!(entry.options["timeout"].as_integer(), Some(5000));
        assert!(Authenticator::from_entry(entry).is_ok());
    }

    #[test]
    fn test_refuses_existing_name() {
        let original = "[auth.salty]\ntype = \"none\"\n";
        let file = config_file(original);
        let err = add_auth(file.path(), &args("salty")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), original);
    }

    #[test]
    fn test_keeps_other_entries() {
        let file = config_file("[auth.simple]\ntype = \"none\"\n");
        add_auth(file.path(), &args("salty")).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.auth.len(), 2);
        assert_eq!(config.auth["simple"].kind, "none");
    }

    #[test]
    fn test_refuses_blank_username() {
        let file = config_file("");
        let mut blank = args("salty");
        blank.username = "   ".to_string();
        assert!(add_auth(file.path(), &blank).is_err());
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(add_auth(&dir.path().join("gateway.toml"), &args("salty")).is_err());
    }

    #[test]
    fn test_display_lists_hash() {
        let file = config_file("");
        let created = add_auth(file.path(), &args("salty")).unwrap();
        let printed = created.to_string();
        assert!(printed.starts_with("New auth: salty"));
        assert!(printed.contains(&created.password_hash));
        assert!(!printed.contains("hunter2"));
    }
}
