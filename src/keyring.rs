//! System keychain lookup for the model API key
//!
//! The environment wins; the keychain is the fallback for machines where the
//! key was stored once with `keyring`-compatible tooling.

use keyring::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

const KEYRING_SERVICE: &str = "pii-redact";
const KEYRING_USERNAME: &str = "openrouter_api_key";

static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    crate::util::parse_flag(&std::env::var("PII_REDACT_DISABLE_KEYRING").unwrap_or_default())
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

/// Warn about keychain errors only once per session
fn warn_keychain_error_once(err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    warn!("Couldn't access system keychain for the API key: {}", err);
    warn!("Set OPENROUTER_API_KEY to bypass the keychain.");
}

/// Read the stored API key, if any. Keychain failures are treated as "no key".
pub fn get_api_key() -> Option<String> {
    if keyring_disabled() {
        return None;
    }
    let entry = match keyring_entry() {
        Ok(entry) => entry,
        Err(err) => {
            warn_keychain_error_once(&err.to_string());
            return None;
        }
    };
    match entry.get_password() {
        Ok(key) if !key.trim().is_empty() => Some(key),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(err) => {
            warn_keychain_error_once(&err.to_string());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_disabled_in_tests() {
        assert!(keyring_disabled());
        assert_eq!(get_api_key(), None);
    }
}
