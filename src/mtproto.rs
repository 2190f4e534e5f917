//! Minimal MTProxy round trip: obfuscated2 transport plus an unencrypted
//! `req_pq_multi` request, answered by the Telegram DC behind the proxy with
//! `resPQ`.

use std::time::Duration;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use async_trait::async_trait;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use ::time::OffsetDateTime;

use crate::faketls::FakeTlsStream;
use crate::probe::{ProbeError, Prober};
use crate::secret::{ProxySecret, SecretMode};
use crate::types::ProbeTarget;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Telegram DC the proxy is asked to relay to.
pub const DEFAULT_DC: i16 = 2;

const TAG_INTERMEDIATE: [u8; 4] = [0xee; 4];
const TAG_PADDED_INTERMEDIATE: [u8; 4] = [0xdd; 4];

const REQ_PQ_MULTI: u32 = 0xbe7e_8ef1;
const RES_PQ: u32 = 0x0516_2463;
const MAX_FRAME: usize = 1 << 20;

/// First four header bytes a client must never send; they collide with other
/// protocols the proxy may sniff for.
const FORBIDDEN_PREFIXES: [[u8; 4]; 7] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0x16, 0x03, 0x01, 0x02],
    [0xdd; 4],
    [0xee; 4],
];

/// Probes MTProxy endpoints with a real obfuscated2 handshake.
#[derive(Debug, Clone)]
pub struct MtProxyProber {
    dc: i16,
}

impl MtProxyProber {
    pub fn new() -> Self {
        Self { dc: DEFAULT_DC }
    }

    pub fn with_dc(mut self, dc: i16) -> Self {
        self.dc = dc;
        self
    }
}

impl Default for MtProxyProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for MtProxyProber {
    async fn round_trip(&self, target: &ProbeTarget) -> Result<Duration, ProbeError> {
        let secret = ProxySecret::decode(&target.secret)?;
        let started = Instant::now();

        let stream = TcpStream::connect((target.server.as_str(), target.port)).await?;
        stream.set_nodelay(true)?;
        let carrier = match &secret.mode {
            SecretMode::FakeTls { domain } => {
                Carrier::FakeTls(FakeTlsStream::connect(stream, &secret.key, domain).await?)
            }
            _ => Carrier::Plain(stream),
        };

        let mut conn = ObfuscatedConnection::new(carrier, &secret, self.dc);
        let nonce: [u8; 16] = rand::random();
        let reply = conn.exchange(&req_pq_multi(&nonce, message_id())).await;
        let latency = started.elapsed();
        conn.shutdown().await;

        check_res_pq(&reply?, &nonce)?;
        Ok(latency)
    }
}

enum Carrier {
    Plain(TcpStream),
    FakeTls(FakeTlsStream),
}

impl Carrier {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        match self {
            Carrier::Plain(s) => Ok(s.write_all(data).await?),
            Carrier::FakeTls(s) => s.write_all(data).await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProbeError> {
        match self {
            Carrier::Plain(s) => {
                s.read_exact(buf).await?;
                Ok(())
            }
            Carrier::FakeTls(s) => s.read_exact(buf).await,
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Carrier::Plain(s) => {
                let _ = s.shutdown().await;
            }
            Carrier::FakeTls(s) => s.shutdown().await,
        }
    }
}

struct ObfuscatedConnection {
    carrier: Carrier,
    encrypt: Aes256Ctr,
    decrypt: Aes256Ctr,
    padded: bool,
    pending_header: Option<[u8; 64]>,
}

impl ObfuscatedConnection {
    fn new(carrier: Carrier, secret: &ProxySecret, dc: i16) -> Self {
        let (tag, padded) = match secret.mode {
            SecretMode::Intermediate => (TAG_INTERMEDIATE, false),
            SecretMode::PaddedIntermediate | SecretMode::FakeTls { .. } => {
                (TAG_PADDED_INTERMEDIATE, true)
            }
        };
        let header = init_header(tag, dc);
        let (encrypt, decrypt, wire_header) = derive_ciphers(&header, &secret.key);
        Self {
            carrier,
            encrypt,
            decrypt,
            padded,
            pending_header: Some(wire_header),
        }
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, ProbeError> {
        self.send_frame(payload).await?;
        self.recv_frame().await
    }

    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), ProbeError> {
        let mut frame = intermediate_frame(payload, self.padded);
        self.encrypt.apply_keystream(&mut frame);
        // The obfuscation header rides along with the first frame.
        let mut out = self
            .pending_header
            .take()
            .map(|h| h.to_vec())
            .unwrap_or_default();
        out.extend_from_slice(&frame);
        self.carrier.write_all(&out).await
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>, ProbeError> {
        let mut len = [0u8; 4];
        self.carrier.read_exact(&mut len).await?;
        self.decrypt.apply_keystream(&mut len);
        let len = (u32::from_le_bytes(len) & 0x7fff_ffff) as usize;
        if len > MAX_FRAME {
            return Err(ProbeError::UnexpectedReply(format!("frame of {len} bytes")));
        }

        let mut body = vec![0u8; len];
        self.carrier.read_exact(&mut body).await?;
        self.decrypt.apply_keystream(&mut body);
        if len == 4 {
            let code = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            return Err(ProbeError::Transport(code));
        }
        Ok(body)
    }

    async fn shutdown(&mut self) {
        self.carrier.shutdown().await;
    }
}

/// Random 64-byte obfuscation header with the protocol tag at 56 and the DC
/// id at 60.
fn init_header(tag: [u8; 4], dc: i16) -> [u8; 64] {
    let mut rng = rand::rng();
    let mut h = [0u8; 64];
    loop {
        rng.fill_bytes(&mut h);
        if h[0] == 0xef
            || h[4..8] == [0u8; 4]
            || FORBIDDEN_PREFIXES.iter().any(|p| h[..4] == p[..])
        {
            continue;
        }
        break;
    }
    h[56..60].copy_from_slice(&tag);
    h[60..62].copy_from_slice(&dc.to_le_bytes());
    h
}

/// Returns `(encrypt, decrypt, header as sent on the wire)`. The encrypt
/// cipher has already consumed the 64 header bytes.
fn derive_ciphers(header: &[u8; 64], secret: &[u8]) -> (Aes256Ctr, Aes256Ctr, [u8; 64]) {
    let mut reversed = [0u8; 48];
    reversed.copy_from_slice(&header[8..56]);
    reversed.reverse();

    let mut encrypt = keyed_cipher(&header[8..40], &header[40..56], secret);
    let decrypt = keyed_cipher(&reversed[..32], &reversed[32..], secret);

    let mut encrypted = *header;
    encrypt.apply_keystream(&mut encrypted);
    let mut wire = *header;
    wire[56..].copy_from_slice(&encrypted[56..]);
    (encrypt, decrypt, wire)
}

fn keyed_cipher(key: &[u8], iv: &[u8], secret: &[u8]) -> Aes256Ctr {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(secret);
    let key = hasher.finalize();
    Aes256Ctr::new(&key, GenericArray::from_slice(iv))
}

/// Intermediate framing: little-endian length then payload. The padded
/// variant appends 0–15 random bytes counted in the length.
fn intermediate_frame(payload: &[u8], padded: bool) -> Vec<u8> {
    let mut rng = rand::rng();
    let padding = if padded { rng.random_range(0..16usize) } else { 0 };
    let mut frame = Vec::with_capacity(4 + payload.len() + padding);
    frame.extend_from_slice(&((payload.len() + padding) as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    let mut pad = vec![0u8; padding];
    rng.fill_bytes(&mut pad);
    frame.extend_from_slice(&pad);
    frame
}

fn req_pq_multi(nonce: &[u8; 16], message_id: i64) -> Vec<u8> {
    let mut m = Vec::with_capacity(40);
    m.extend_from_slice(&0u64.to_le_bytes());
    m.extend_from_slice(&message_id.to_le_bytes());
    m.extend_from_slice(&20u32.to_le_bytes());
    m.extend_from_slice(&REQ_PQ_MULTI.to_le_bytes());
    m.extend_from_slice(nonce);
    m
}

/// Unix time in 1/2^32 second units, divisible by 4 as client ids must be.
fn message_id() -> i64 {
    let now = OffsetDateTime::now_utc();
    let frac = ((now.nanosecond() as i64) << 32) / 1_000_000_000;
    ((now.unix_timestamp() << 32) | frac) & !3
}

fn check_res_pq(reply: &[u8], nonce: &[u8; 16]) -> Result<(), ProbeError> {
    if reply.len() < 40 {
        return Err(ProbeError::UnexpectedReply(format!(
            "short reply ({} bytes)",
            reply.len()
        )));
    }
    let constructor = u32::from_le_bytes([reply[20], reply[21], reply[22], reply[23]]);
    if constructor != RES_PQ {
        return Err(ProbeError::UnexpectedReply(format!(
            "constructor {constructor:#010x}"
        )));
    }
    if reply[24..40] != nonce[..] {
        return Err(ProbeError::UnexpectedReply("nonce mismatch".into()));
    }
    Ok(())
}
