//! Payload ciphers.
//!
//! A cipher is a pure function of (text, key). Keys are ordered lists of
//! integers. Devices pick a cipher by name; the [`CipherSuite`] owns the
//! name → implementation table and rejects names it does not know.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ScapeError;

/// Name of the identity cipher.
pub const PLAIN: &str = "plain";

/// Name of the printable-band shift cipher.
pub const CAESAR: &str = "caesar";

/// First code point of the printable ASCII band.
const BAND_START: i64 = 32;

/// Width of the printable ASCII band [32, 126].
const BAND_WIDTH: i64 = 127 - 32;

/// Symmetric encrypt/decrypt strategy keyed by an integer array.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, text: &str, key: &[i64]) -> String;
    fn decrypt(&self, text: &str, key: &[i64]) -> String;
}

// ── Built-in ciphers ──────────────────────────────────────────────────────────

/// Identity on both directions. Ignores the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plain;

impl Cipher for Plain {
    fn encrypt(&self, text: &str, _key: &[i64]) -> String {
        text.to_string()
    }

    fn decrypt(&self, text: &str, _key: &[i64]) -> String {
        text.to_string()
    }
}

/// Shifts character i by `key[i % key.len()]`, wrapping inside [32, 126].
///
/// An empty key leaves the text unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Caesar;

impl Caesar {
    fn shift(text: &str, key: &[i64], sign: i64) -> String {
        if key.is_empty() {
            return text.to_string();
        }
        text.chars()
            .enumerate()
            .map(|(i, c)| {
                let shift = key[i % key.len()].rem_euclid(BAND_WIDTH) * sign;
                let code = (c as i64 - BAND_START + shift).rem_euclid(BAND_WIDTH) + BAND_START;
                // code is always inside the printable band
                char::from(code as u8)
            })
            .collect()
    }
}

impl Cipher for Caesar {
    fn encrypt(&self, text: &str, key: &[i64]) -> String {
        Self::shift(text, key, 1)
    }

    fn decrypt(&self, text: &str, key: &[i64]) -> String {
        Self::shift(text, key, -1)
    }
}

// ── Suite ─────────────────────────────────────────────────────────────────────

/// Name → cipher table. Names are case-insensitive.
#[derive(Clone)]
pub struct CipherSuite {
    ciphers: HashMap<String, Arc<dyn Cipher>>,
}

impl CipherSuite {
    /// A suite with no ciphers registered.
    pub fn empty() -> Self {
        Self {
            ciphers: HashMap::new(),
        }
    }

    /// `plain` and `caesar`.
    pub fn with_defaults() -> Self {
        let mut suite = Self::empty();
        suite.register(PLAIN, Arc::new(Plain));
        suite.register(CAESAR, Arc::new(Caesar));
        suite
    }

    /// Add or replace a cipher under `name`.
    pub fn register(&mut self, name: &str, cipher: Arc<dyn Cipher>) {
        self.ciphers.insert(name.to_lowercase(), cipher);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ciphers.contains_key(&name.to_lowercase())
    }

    /// Look up a cipher. Unknown names are an error, never a silent default.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Cipher>, ScapeError> {
        self.ciphers
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| ScapeError::InvalidCipher(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ciphers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSuite")
            .field("ciphers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "",
        "set speed 10 -10",
        "~~~ edge of the band ~~~",
        " !\"#$%&'()*+,-./0123456789:;<=>?@AZaz{|}~",
    ];

    const KEYS: &[&[i64]] = &[&[0], &[1, 2, 3, 4], &[-7, 200], &[94], &[i64::MAX, i64::MIN]];

    #[test]
    fn caesar_round_trips_printable_text() {
        for text in SAMPLES {
            for key in KEYS {
                let encrypted = Caesar.encrypt(text, key);
                assert_eq!(Caesar.decrypt(&encrypted, key), *text, "key {key:?}");
            }
        }
    }

    #[test]
    fn plain_is_identity_for_any_key() {
        for text in SAMPLES {
            for key in KEYS {
                assert_eq!(Plain.encrypt(text, key), *text);
                assert_eq!(Plain.decrypt(text, key), *text);
            }
        }
    }

    #[test]
    fn caesar_shifts_and_wraps() {
        assert_eq!(Caesar.encrypt("abc", &[1]), "bcd");
        assert_eq!(Caesar.encrypt("abc", &[1, 2]), "bdd");
        // '~' is 126, one past it wraps to ' '
        assert_eq!(Caesar.encrypt("~", &[1]), " ");
        assert_eq!(Caesar.decrypt(" ", &[1]), "~");
    }

    #[test]
    fn caesar_with_empty_key_is_unchanged() {
        assert_eq!(Caesar.encrypt("hello", &[]), "hello");
    }

    #[test]
    fn suite_rejects_unknown_names() {
        let suite = CipherSuite::with_defaults();
        assert!(suite.get("plain").is_ok());
        assert!(suite.get("CAESAR").is_ok());
        let err = suite.get("speck").err().expect("speck is not registered");
        assert!(matches!(err, ScapeError::InvalidCipher(name) if name == "speck"));
    }

    #[test]
    fn suite_accepts_registered_ciphers() {
        struct Reverse;
        impl Cipher for Reverse {
            fn encrypt(&self, text: &str, _key: &[i64]) -> String {
                text.chars().rev().collect()
            }
            fn decrypt(&self, text: &str, _key: &[i64]) -> String {
                text.chars().rev().collect()
            }
        }

        let mut suite = CipherSuite::with_defaults();
        suite.register("Reverse", Arc::new(Reverse));
        assert_eq!(suite.names(), vec!["caesar", "plain", "reverse"]);
        let cipher = suite.get("reverse").unwrap();
        assert_eq!(cipher.encrypt("abc", &[]), "cba");
    }
}
