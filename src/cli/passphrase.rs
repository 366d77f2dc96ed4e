//! Passphrase acquisition for the command-line boundary.
//!
//! Interactive use prompts on the terminal without echo. For scripts and tests
//! the passphrase can be supplied through an environment variable, which
//! bypasses the prompt entirely.

use crate::errors::{AppResult, CryptoError};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use tracing::debug;

/// Reads an existing passphrase from `env_var` or an interactive prompt.
///
/// # Errors
///
/// Returns `CryptoError::EmptyPassphrase` for an empty value and
/// `CryptoError::PassphrasePrompt` if the terminal cannot be read.
pub fn read_passphrase(env_var: &str, prompt: &str) -> AppResult<SecretString> {
    let raw = match env::var(env_var) {
        Ok(value) => {
            debug!("Using {} for non-interactive passphrase", env_var);
            value
        }
        Err(_) => rpassword::prompt_password(prompt)
            .map_err(|e| CryptoError::PassphrasePrompt(e.to_string()))?,
    };
    non_empty(raw)
}

/// Reads a new passphrase, asking twice when prompting interactively.
///
/// # Errors
///
/// Returns `CryptoError::PassphraseMismatch` if the confirmation differs.
pub fn read_new_passphrase(env_var: &str) -> AppResult<SecretString> {
    if let Ok(value) = env::var(env_var) {
        debug!("Using {} for non-interactive passphrase", env_var);
        return non_empty(value);
    }

    let first = non_empty(
        rpassword::prompt_password("New passphrase: ")
            .map_err(|e| CryptoError::PassphrasePrompt(e.to_string()))?,
    )?;
    let confirm = SecretString::from(
        rpassword::prompt_password("Confirm passphrase: ")
            .map_err(|e| CryptoError::PassphrasePrompt(e.to_string()))?,
    );
    if first.expose_secret() != confirm.expose_secret() {
        return Err(CryptoError::PassphraseMismatch.into());
    }
    Ok(first)
}

fn non_empty(raw: String) -> AppResult<SecretString> {
    if raw.is_empty() {
        return Err(CryptoError::EmptyPassphrase.into());
    }
    Ok(SecretString::from(raw))
}
