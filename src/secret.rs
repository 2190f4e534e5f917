//! MTProxy secret decoding.
//!
//! Secrets come as hex or base64 and carry a one-byte prefix that selects the
//! transport: none for the plain intermediate transport, `dd` for padded
//! intermediate, `ee` for fake-TLS (followed by the SNI domain).

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::probe::ProbeError;

pub const KEY_LEN: usize = 16;

const PADDED_PREFIX: u8 = 0xdd;
const FAKE_TLS_PREFIX: u8 = 0xee;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretMode {
    Intermediate,
    PaddedIntermediate,
    FakeTls { domain: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySecret {
    pub key: [u8; KEY_LEN],
    pub mode: SecretMode,
}

impl ProxySecret {
    pub fn decode(raw: &str) -> Result<Self, ProbeError> {
        let bytes = decode_bytes(raw.trim())
            .ok_or_else(|| ProbeError::Secret("neither hex nor base64".into()))?;

        let (mode, key) = match bytes.first() {
            Some(&PADDED_PREFIX) if bytes.len() == KEY_LEN + 1 => {
                (SecretMode::PaddedIntermediate, &bytes[1..])
            }
            Some(&FAKE_TLS_PREFIX) if bytes.len() > KEY_LEN + 1 => {
                let domain = String::from_utf8(bytes[KEY_LEN + 1..].to_vec())
                    .map_err(|_| ProbeError::Secret("fake-TLS domain is not UTF-8".into()))?;
                (SecretMode::FakeTls { domain }, &bytes[1..KEY_LEN + 1])
            }
            _ if bytes.len() == KEY_LEN => (SecretMode::Intermediate, &bytes[..]),
            _ => {
                return Err(ProbeError::Secret(format!(
                    "unsupported secret layout ({} bytes)",
                    bytes.len()
                )))
            }
        };

        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(key);
        Ok(Self { key: out, mode })
    }
}

fn decode_bytes(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 == 0 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(raw).ok();
    }
    [&URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD_NO_PAD, &STANDARD]
        .iter()
        .find_map(|engine| engine.decode(raw).ok())
}
