//! Variables shared between the stages of a single deployment run.

use std::{collections::BTreeMap, sync::LazyLock};

use derive_more::Deref;
use regex::{Captures, Regex};

use crate::error::ContextError;

/// Matches `${KEY}` placeholders. Keys use the environment variable alphabet.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Values populated by earlier stages and read by later ones.
///
/// Keys are write-once: [`PipelineContext::set`] refuses to replace an existing
/// value with a different one, a stage that supersedes a value must call
/// [`PipelineContext::overwrite`]. Readers go through [`PipelineContext::require`]
/// so that an absent or empty value fails the run instead of leaking an empty
/// string into a command line.
#[derive(Debug, Clone, Default, Deref)]
pub struct PipelineContext {
    vars: BTreeMap<String, String>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` for the first time. Setting the same value again is accepted.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), ContextError> {
        let key = key.into();
        let value = value.into();

        match self.vars.get(&key) {
            Some(existing) if *existing != value => Err(ContextError::AlreadySet { key }),
            Some(_) => Ok(()),
            None => {
                tracing::trace!(key = %key, "Context variable set");
                self.vars.insert(key, value);
                Ok(())
            }
        }
    }

    /// Replace the value of `key`, whether or not it was set before.
    pub fn overwrite(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.vars.contains_key(&key) {
            tracing::debug!(key = %key, "Context variable overwritten");
        }
        self.vars.insert(key, value.into());
    }

    /// Read a value that must be present and non-empty.
    pub fn require(&self, key: &str) -> Result<&str, ContextError> {
        match self.vars.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ContextError::Missing(key.to_string())),
        }
    }

    /// Substitute every `${KEY}` in `template` with its context value.
    ///
    /// Fails on the first placeholder whose key is missing or empty.
    pub fn render(&self, template: &str) -> Result<String, ContextError> {
        let mut missing = None;

        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
            match self.require(&caps[1]) {
                Ok(value) => value.to_string(),
                Err(err) => {
                    missing.get_or_insert(err);
                    String::new()
                }
            }
        });

        match missing {
            Some(err) => Err(err),
            None => Ok(rendered.into_owned()),
        }
    }

    /// Keys referenced by `template`, in order of appearance.
    pub fn placeholders(template: &str) -> Vec<String> {
        PLACEHOLDER
            .captures_iter(template)
            .map(|caps| caps[1].to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_write_once() {
        let mut ctx = PipelineContext::new();
        ctx.set("CHAIN_ID", "999").unwrap();
        ctx.set("CHAIN_ID", "999").unwrap();

        let err = ctx.set("CHAIN_ID", "1000").unwrap_err();
        assert_eq!(
            err,
            ContextError::AlreadySet {
                key: "CHAIN_ID".to_string()
            }
        );
        assert_eq!(ctx.require("CHAIN_ID").unwrap(), "999");

        ctx.overwrite("CHAIN_ID", "1000");
        assert_eq!(ctx.require("CHAIN_ID").unwrap(), "1000");
    }

    #[test]
    fn test_require_fails_fast_on_empty() {
        let mut ctx = PipelineContext::new();
        ctx.set("NODE_IP", "").unwrap();

        assert_eq!(
            ctx.require("NODE_IP").unwrap_err(),
            ContextError::Missing("NODE_IP".to_string())
        );
        assert!(ctx.require("TX_HASH").is_err());
    }

    #[test]
    fn test_render() {
        let mut ctx = PipelineContext::new();
        ctx.set("L1_RPC_URL", "http://l1:8545").unwrap();
        ctx.set("L2_CHAIN_ID", "42069").unwrap();

        assert_eq!(
            ctx.render("--l1=${L1_RPC_URL} --chain ${L2_CHAIN_ID} $HOME").unwrap(),
            "--l1=http://l1:8545 --chain 42069 $HOME"
        );
        assert_eq!(
            ctx.render("${L2_CHAIN_ID}${MISSING}").unwrap_err(),
            ContextError::Missing("MISSING".to_string())
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            PipelineContext::placeholders("${A} and ${B_2} but not $C"),
            vec!["A".to_string(), "B_2".to_string()]
        );
    }
}
