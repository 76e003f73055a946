//! Shadowsocks session initialisation.
//!
//! Only the connectivity-relevant part of the AEAD handshake is performed:
//! the cipher is validated and the per-session salt is sent. Payload
//! encryption is out of scope.

use rand::RngCore;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::ProxyHop;

/// AEAD ciphers and their salt lengths.
const AEAD_CIPHERS: &[(&str, usize)] = &[
    ("aes-128-gcm", 16),
    ("aes-256-gcm", 32),
    ("chacha20-ietf-poly1305", 32),
];

/// Salt length for `cipher`, or `None` if it is not a supported AEAD cipher.
pub fn salt_len(cipher: &str) -> Option<usize> {
    let cipher = cipher.to_lowercase();
    AEAD_CIPHERS
        .iter()
        .find(|(name, _)| *name == cipher)
        .map(|(_, len)| *len)
}

/// Validate the hop's cipher and password, then write a fresh salt.
pub async fn init_session<S, R>(stream: &mut S, hop: &ProxyHop, rng: &mut R) -> Result<(), String>
where
    S: AsyncWrite + Unpin + ?Sized,
    R: RngCore + ?Sized,
{
    let cipher = hop
        .cipher
        .as_deref()
        .ok_or_else(|| "no cipher configured".to_string())?;
    let len = salt_len(cipher).ok_or_else(|| format!("unsupported cipher '{}'", cipher))?;
    let has_password = hop
        .credentials
        .as_ref()
        .is_some_and(|c| !c.password.is_empty());
    if !has_password {
        return Err("no password configured".to_string());
    }

    let mut salt = vec![0u8; len];
    rng.fill_bytes(&mut salt);
    stream
        .write_all(&salt)
        .await
        .map_err(|e| format!("failed to send session salt: {}", e))?;
    stream
        .flush()
        .await
        .map_err(|e| format!("failed to send session salt: {}", e))?;
    Ok(())
}
