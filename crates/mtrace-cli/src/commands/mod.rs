//! Command handlers

pub mod config;
pub mod conflicts;
pub mod data;
pub mod queue;
pub mod status;
pub mod sync;

use std::io::{self, IsTerminal, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use uuid::Uuid;

use mtrace_core::SyncEngine;

/// Parse a JSON argument, reading it from a file when given as `@path`
pub(crate) fn parse_json_arg(arg: &str) -> Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("Failed to read payload file: {}", path))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

/// Account to sync: the signed-in one, else the configured one
pub(crate) fn require_account(engine: &SyncEngine) -> Result<String> {
    match engine
        .account_id()
        .or_else(|| engine.config().account_id.clone())
    {
        Some(account) => Ok(account),
        None => bail!("No account signed in. Run `mtrace login <account>` first."),
    }
}

/// Ask a yes/no question; anything but yes (or no TTY) is no
pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    if !io::stdin().is_terminal() {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

/// Find a unique id by full UUID or prefix
pub(crate) fn match_id(ids: impl IntoIterator<Item = Uuid>, needle: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(needle) {
        return Ok(id);
    }

    let needle = needle.to_ascii_lowercase();
    let matches: Vec<Uuid> = ids
        .into_iter()
        .filter(|id| id.to_string().starts_with(&needle))
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No item matches '{}'", needle),
        _ => bail!(
            "Ambiguous id '{}' matches {} items; use more characters",
            needle,
            matches.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_json_arg_inline() {
        let value = parse_json_arg(r#"{"id": "s1", "title": "T"}"#).unwrap();
        assert_eq!(value["id"], "s1");
        assert!(parse_json_arg("{not json").is_err());
    }

    #[test]
    fn test_parse_json_arg_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"id": "a1", "v": 2}}"#).unwrap();

        let arg = format!("@{}", file.path().display());
        let value = parse_json_arg(&arg).unwrap();
        assert_eq!(value["v"], 2);

        assert!(parse_json_arg("@/nonexistent/payload.json").is_err());
    }

    #[test]
    fn test_match_id_by_prefix() {
        let a = Uuid::parse_str("0f8e2c3a-0000-4000-8000-000000000001").unwrap();
        let b = Uuid::parse_str("0f8e9999-0000-4000-8000-000000000002").unwrap();

        assert_eq!(match_id([a, b], "0f8e2").unwrap(), a);
        assert_eq!(match_id([a, b], "0F8E99").unwrap(), b);
        assert!(match_id([a, b], "0f8e").is_err());
        assert!(match_id([a, b], "ffff").is_err());
        assert_eq!(match_id([], &a.to_string()).unwrap(), a);
    }
}
