//! Device tokens and token storage.
//!
//! Every device guards its data frames with a 16-byte token. Tokens are
//! either supplied by the user (hex string or raw bytes) or extracted from
//! the handshake reply when the device still advertises one. A
//! [`TokenStorage`] lets enrichment look up tokens learned in earlier
//! sessions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ProtocolError, Result};

/// Token length on the wire.
pub const TOKEN_LEN: usize = 16;

/// A 16-byte device token.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidToken(format!("expected {} bytes, got {}", TOKEN_LEN, bytes.len()))
        })?;
        Ok(Token(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl From<[u8; TOKEN_LEN]> for Token {
    fn from(bytes: [u8; TOKEN_LEN]) -> Self {
        Token(bytes)
    }
}

impl FromStr for Token {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ProtocolError::InvalidToken(format!("not a hex string: {}", e)))?;
        Token::from_bytes(&bytes)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

impl serde::Serialize for Token {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Token {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        use serde::Deserialize;
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Store for tokens learned or configured for devices, keyed by device id.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    async fn load(&self, device_id: u32) -> Result<Option<Token>>;
    async fn store(&self, device_id: u32, token: Token) -> Result<()>;
}

/// In-memory token store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryTokenStorage {
    tokens: Mutex<HashMap<u32, Token>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn load(&self, device_id: u32) -> Result<Option<Token>> {
        Ok(self.tokens.lock().get(&device_id).copied())
    }

    async fn store(&self, device_id: u32, token: Token) -> Result<()> {
        self.tokens.lock().insert(device_id, token);
        Ok(())
    }
}

/// Token store backed by a JSON file mapping device ids to hex tokens.
pub struct FileTokenStorage {
    path: PathBuf,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<HashMap<u32, Token>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(ProtocolError::socket_io(e)),
        };
        let map: HashMap<String, Token> = serde_json::from_slice(&raw)?;
        let mut tokens = HashMap::new();
        for (id, token) in map {
            let id: u32 = id
                .parse()
                .map_err(|_| ProtocolError::InvalidToken(format!("bad device id key: {}", id)))?;
            tokens.insert(id, token);
        }
        Ok(tokens)
    }

    async fn write_all(&self, tokens: &HashMap<u32, Token>) -> Result<()> {
        let map: HashMap<String, &Token> = tokens
            .iter()
            .map(|(id, token)| (id.to_string(), token))
            .collect();
        let raw = serde_json::to_vec_pretty(&map)?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(ProtocolError::socket_io)
    }
}

#[async_trait]
impl TokenStorage for FileTokenStorage {
    async fn load(&self, device_id: u32) -> Result<Option<Token>> {
        Ok(self.read_all().await?.get(&device_id).copied())
    }

    async fn store(&self, device_id: u32, token: Token) -> Result<()> {
        let mut tokens = self.read_all().await?;
        tokens.insert(device_id, token);
        self.write_all(&tokens).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hex_round_trip() {
        let token: Token = "00112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(token.to_string(), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_token_rejects_wrong_length() {
        assert!("0011".parse::<Token>().is_err());
        assert!(Token::from_bytes(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_token_rejects_non_hex() {
        assert!("zz112233445566778899aabbccddeeff".parse::<Token>().is_err());
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryTokenStorage::new();
        let token: Token = "00112233445566778899aabbccddeeff".parse().unwrap();

        assert_eq!(storage.load(1234).await.unwrap(), None);
        storage.store(1234, token).await.unwrap();
        assert_eq!(storage.load(1234).await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileTokenStorage::new(dir.path().join("tokens.json"));
        let token: Token = "ffeeddccbbaa99887766554433221100".parse().unwrap();

        assert_eq!(storage.load(42).await.unwrap(), None);
        storage.store(42, token).await.unwrap();
        assert_eq!(storage.load(42).await.unwrap(), Some(token));

        // A second entry must not clobber the first
        let other: Token = "00112233445566778899aabbccddeeff".parse().unwrap();
        storage.store(7, other).await.unwrap();
        assert_eq!(storage.load(42).await.unwrap(), Some(token));
        assert_eq!(storage.load(7).await.unwrap(), Some(other));
    }
}
