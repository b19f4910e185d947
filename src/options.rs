use std::fmt;

use crate::error::OptionsError;

/// Flags the agent controls itself or that would let a caller read or write
/// arbitrary files on the agent host.
const RESERVED_FLAGS: &[&str] = &[
    "--resume",
    "--stylesheet",
    "--webxml",
    "--datadir",
    "--servicedb",
    "--versiondb",
    "--script-args-file",
    "--append-output",
    "-iL",
];

/// Targets and flags for one scanner run, split into argv tokens.
///
/// Tokens are separated by ASCII whitespace and passed to the scanner
/// verbatim; there is no shell and no quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    tokens: Vec<String>,
}

impl ScanOptions {
    pub fn parse(raw: &str) -> Result<Self, OptionsError> {
        let tokens: Vec<String> = raw.split_ascii_whitespace().map(str::to_owned).collect();
        if tokens.is_empty() {
            return Err(OptionsError::Empty);
        }
        for token in &tokens {
            if token.chars().any(char::is_control) {
                return Err(OptionsError::ControlCharacter(token.clone()));
            }
            if is_reserved(token) {
                return Err(OptionsError::ReservedFlag(token.clone()));
            }
        }
        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl fmt::Display for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

fn is_reserved(token: &str) -> bool {
    // -oX, -oN, -oA, ... and their `--flag=value` spellings
    if token.starts_with("-o") && !token.starts_with("--") {
        return true;
    }
    let name = token.split_once('=').map(|(n, _)| n).unwrap_or(token);
    RESERVED_FLAGS.contains(&name)
}
