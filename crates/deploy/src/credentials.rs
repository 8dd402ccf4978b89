//! Deployment credentials.
//!
//! Every private key used by a deployment comes from one place: the
//! environment (`ROLLSTACK_<ROLE>_PRIVATE_KEY`) when set, otherwise a single
//! credentials file that is generated on the first run and reused afterwards.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use derive_more::Deref;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::{context::PipelineContext, error::ContextError, fs::FsHandler};

/// Prefix of the environment variables that override a role's key.
pub const ENV_PREFIX: &str = "ROLLSTACK_";

/// An on-chain identity a deployment needs a key for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Deployer,
    Batcher,
    Proposer,
    Sequencer,
    Challenger,
}

impl Role {
    /// Key of the private key, both in the credentials file and in the context.
    pub fn private_key_var(&self) -> String {
        format!("{self}_PRIVATE_KEY")
    }

    pub fn address_var(&self) -> String {
        format!("{self}_ADDRESS")
    }

    /// Environment variable overriding the stored key.
    pub fn env_override_var(&self) -> String {
        format!("{ENV_PREFIX}{}", self.private_key_var())
    }
}

/// A role's signing key.
#[derive(Debug, Clone)]
pub struct Account {
    signer: PrivateKeySigner,
}

impl Account {
    fn parse(role: Role, raw: &str) -> anyhow::Result<Self> {
        let signer = PrivateKeySigner::from_str(raw.trim())
            .with_context(|| format!("Invalid private key for {role}"))?;
        Ok(Self { signer })
    }

    fn generate() -> Self {
        Self {
            signer: PrivateKeySigner::random(),
        }
    }

    /// `0x`-prefixed hex private key.
    pub fn private_key(&self) -> String {
        format!("0x{}", hex::encode(self.signer.to_bytes()))
    }

    /// Checksummed address.
    pub fn address(&self) -> String {
        self.signer.address().to_string()
    }
}

/// Where a role's key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum KeySource {
    Environment,
    File,
    Generated,
}

/// The resolved keys of one run, by role.
#[derive(Debug, Clone, Default, Deref)]
pub struct Credentials(BTreeMap<Role, Account>);

impl Credentials {
    /// Publish `<ROLE>_PRIVATE_KEY` and `<ROLE>_ADDRESS` for every role.
    pub fn export(&self, ctx: &mut PipelineContext) -> Result<(), ContextError> {
        for (role, account) in &self.0 {
            ctx.set(role.private_key_var(), account.private_key())?;
            ctx.set(role.address_var(), account.address())?;
        }
        Ok(())
    }
}

/// Loads, generates and persists the credentials file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    roles: Vec<Role>,
    overrides: BTreeMap<Role, String>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            path: path.into(),
            roles: roles.into_iter().collect(),
            overrides: BTreeMap::new(),
        }
    }

    /// Pick up `ROLLSTACK_<ROLE>_PRIVATE_KEY` overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        for role in &self.roles {
            match std::env::var(role.env_override_var()) {
                Ok(value) if !value.trim().is_empty() => {
                    self.overrides.insert(*role, value);
                }
                _ => {}
            }
        }
        self
    }

    pub fn with_override(mut self, role: Role, private_key: impl Into<String>) -> Self {
        self.overrides.insert(role, private_key.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Holds once every role without an override has a key in the file.
    pub fn is_complete(&self) -> bool {
        let Ok(stored) = read_entries(&self.path) else {
            return false;
        };
        self.roles.iter().all(|role| {
            self.overrides.contains_key(role) || stored.contains_key(&role.private_key_var())
        })
    }

    /// Resolve a key for every role, generating and persisting missing ones.
    ///
    /// Keys taken from the environment are never written to the file.
    pub fn load_or_generate(&self) -> anyhow::Result<Credentials> {
        let mut stored = if self.path.exists() {
            read_entries(&self.path)?
        } else {
            BTreeMap::new()
        };

        let mut accounts = BTreeMap::new();
        let mut generated = false;

        for role in &self.roles {
            let (account, source) = if let Some(raw) = self.overrides.get(role) {
                (Account::parse(*role, raw)?, KeySource::Environment)
            } else if let Some(raw) = stored.get(&role.private_key_var()) {
                (Account::parse(*role, raw)?, KeySource::File)
            } else {
                let account = Account::generate();
                stored.insert(role.private_key_var(), account.private_key());
                stored.insert(role.address_var(), account.address());
                generated = true;
                (account, KeySource::Generated)
            };

            tracing::info!(role = %role, address = %account.address(), source = %source, "Loaded credentials");
            accounts.insert(*role, account);
        }

        if generated {
            let contents = stored
                .iter()
                .map(|(key, value)| format!("{key}={value}\n"))
                .collect::<String>();
            FsHandler::write_private(&self.path, contents.as_bytes())
                .with_context(|| format!("Failed to persist credentials to {}", self.path.display()))?;
            tracing::info!(path = %self.path.display(), "Credentials file written");
        }

        Ok(Credentials(accounts))
    }
}

/// Parse a flat `KEY=VALUE` file. Blank lines and `#` comments are ignored.
fn read_entries(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials file {}", path.display()))?;

    let mut entries = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("Malformed line in {}: {line}", path.display()))?;
        entries.insert(
            key.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    Ok(entries)
}
