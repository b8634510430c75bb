//! Repeating-key XOR encryption for string literals embedded in generated source.
//!
//! Nothing here ever decrypts on the producer side outside of tests: the emitted expression hands
//! cipher text, key table and table length to a decrypt function of the consuming program, which
//! caches its result by the exact cipher literal.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Random key table of a fixed length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTable(Vec<u8>);

impl KeyTable {
    /// Draws a table of `len` random bytes. A zero length is bumped to one.
    pub fn generate<R: Rng>(len: usize, rng: &mut R) -> Self {
        let mut table = vec![0u8; len.max(1)];
        rng.fill(table.as_mut_slice());
        Self(table)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        (!bytes.is_empty()).then_some(Self(bytes))
    }

    /// `cipher[i] = plain[i] ^ table[i % len]`.
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        plain
            .iter()
            .zip(self.0.iter().cycle())
            .map(|(p, k)| p ^ k)
            .collect()
    }

    /// XOR is its own inverse.
    pub fn decrypt(&self, cipher: &[u8]) -> Vec<u8> {
        self.encrypt(cipher)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A literal after encryption, ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedString {
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub cipher: Vec<u8>,
    /// Call expression that decrypts the literal at run time.
    pub expression: String,
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }
}

/// Builds decrypt expressions around a named runtime function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringEncryptor {
    /// Name of the decrypt function in the consuming program.
    pub function: String,
}

impl Default for StringEncryptor {
    fn default() -> Self {
        Self {
            function: "decrypt".to_string(),
        }
    }
}

impl StringEncryptor {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
        }
    }

    /// Encrypts `plain` under a fresh key table as long as the payload.
    pub fn encrypt<R: Rng>(&self, plain: &[u8], rng: &mut R) -> EncryptedString {
        let table = KeyTable::generate(plain.len(), rng);
        self.encrypt_with(plain, &table)
    }

    pub fn encrypt_with(&self, plain: &[u8], table: &KeyTable) -> EncryptedString {
        let cipher = table.encrypt(plain);
        // Cipher literal first: the consumer's cache is keyed by it.
        let expression = format!(
            "{}({}, {}, {})",
            self.function,
            byte_literal(&cipher),
            byte_literal(table.as_bytes()),
            table.len()
        );
        EncryptedString {
            key: table.as_bytes().to_vec(),
            cipher,
            expression,
        }
    }
}

/// Quoted string literal spelling every byte as a decimal escape.
pub fn byte_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 2);
    out.push('"');
    for b in bytes {
        let _ = write!(out, "\\{b}");
    }
    out.push('"');
    out
}
