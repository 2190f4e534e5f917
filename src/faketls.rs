//! Fake-TLS wrapping used by `ee` secrets.
//!
//! The client sends a ClientHello whose random field is an HMAC of the hello
//! under the proxy key, consumes the server's canned handshake, then frames
//! all traffic as TLS application-data records.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::probe::ProbeError;

type HmacSha256 = Hmac<Sha256>;

const RECORD_CHANGE_CIPHER: u8 = 0x14;
const RECORD_ALERT: u8 = 0x15;
const RECORD_HANDSHAKE: u8 = 0x16;
const RECORD_APPLICATION: u8 = 0x17;

pub(crate) const HELLO_LEN: usize = 517;
const RANDOM_OFFSET: usize = 11;
const MAX_RECORD: usize = 16_384;

const HELLO_PREFIX: [u8; 11] = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc, 0x03, 0x03];
const CHANGE_CIPHER_SPEC: [u8; 6] = [0x14, 0x03, 0x03, 0x00, 0x01, 0x01];

const CIPHER_SUITES: [u8; 34] = [
    0x00, 0x20, 0x0a, 0x0a, 0x13, 0x01, 0x13, 0x02, 0x13, 0x03, 0xc0, 0x2b, 0xc0, 0x2f, 0xc0,
    0x2c, 0xc0, 0x30, 0xcc, 0xa9, 0xcc, 0xa8, 0xc0, 0x13, 0xc0, 0x14, 0x00, 0x9c, 0x00, 0x9d,
    0x00, 0x2f, 0x00, 0x35,
];

pub(crate) struct FakeTlsStream {
    stream: TcpStream,
    inbound: Vec<u8>,
    sent_change_cipher: bool,
}

impl FakeTlsStream {
    /// Run the fake handshake over a freshly connected stream.
    pub(crate) async fn connect(
        mut stream: TcpStream,
        key: &[u8],
        domain: &str,
    ) -> Result<Self, ProbeError> {
        let hello = client_hello(key, domain, unix_time())?;
        stream.write_all(&hello).await?;

        let (kind, _) = read_record(&mut stream).await?;
        if kind != RECORD_HANDSHAKE {
            return Err(ProbeError::Handshake(format!(
                "expected ServerHello, got record type {kind:#04x}"
            )));
        }
        // ChangeCipherSpec then one application record carrying the fake certificate.
        loop {
            match read_record(&mut stream).await? {
                (RECORD_CHANGE_CIPHER, _) => continue,
                (RECORD_APPLICATION, _) => break,
                (kind, _) => {
                    return Err(ProbeError::Handshake(format!(
                        "unexpected record type {kind:#04x} in server handshake"
                    )))
                }
            }
        }

        Ok(Self {
            stream,
            inbound: Vec::new(),
            sent_change_cipher: false,
        })
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        let mut out = Vec::with_capacity(data.len() + CHANGE_CIPHER_SPEC.len() + 5);
        if !self.sent_change_cipher {
            out.extend_from_slice(&CHANGE_CIPHER_SPEC);
            self.sent_change_cipher = true;
        }
        for chunk in data.chunks(MAX_RECORD) {
            out.extend_from_slice(&[RECORD_APPLICATION, 0x03, 0x03]);
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.extend_from_slice(chunk);
        }
        self.stream.write_all(&out).await?;
        Ok(())
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProbeError> {
        while self.inbound.len() < buf.len() {
            match read_record(&mut self.stream).await? {
                (RECORD_APPLICATION, body) => self.inbound.extend_from_slice(&body),
                (RECORD_CHANGE_CIPHER, _) => {}
                (RECORD_ALERT, _) => {
                    return Err(ProbeError::Handshake("proxy sent a TLS alert".into()))
                }
                (kind, _) => {
                    return Err(ProbeError::UnexpectedReply(format!(
                        "record type {kind:#04x}"
                    )))
                }
            }
        }
        buf.copy_from_slice(&self.inbound[..buf.len()]);
        self.inbound.drain(..buf.len());
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn read_record(stream: &mut TcpStream) -> Result<(u8, Vec<u8>), ProbeError> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x03 {
        return Err(ProbeError::Handshake("not a TLS record".into()));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len > MAX_RECORD + 2_048 {
        return Err(ProbeError::Handshake(format!("oversized TLS record ({len} bytes)")));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok((header[0], body))
}

/// Build the 517-byte ClientHello. The random field holds
/// `HMAC-SHA256(key, hello)` with the timestamp XOR-ed into its last 4 bytes.
pub(crate) fn client_hello(key: &[u8], domain: &str, timestamp: u32) -> Result<Vec<u8>, ProbeError> {
    let mut rng = rand::rng();
    let mut h = Vec::with_capacity(HELLO_LEN);
    h.extend_from_slice(&HELLO_PREFIX);
    h.extend_from_slice(&[0u8; 32]);
    h.push(0x20);
    let mut session_id = [0u8; 32];
    rng.fill_bytes(&mut session_id);
    h.extend_from_slice(&session_id);
    h.extend_from_slice(&CIPHER_SUITES);
    h.extend_from_slice(&[0x01, 0x00]);

    let extensions_at = h.len();
    h.extend_from_slice(&[0x00, 0x00]);

    let name = domain.as_bytes();
    let mut sni = Vec::with_capacity(name.len() + 5);
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(0x00);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);
    push_extension(&mut h, 0x0000, &sni);

    push_extension(&mut h, 0x0017, &[]);
    push_extension(&mut h, 0xff01, &[0x00]);
    push_extension(&mut h, 0x000a, &[0x00, 0x06, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18]);
    push_extension(&mut h, 0x000b, &[0x01, 0x00]);
    push_extension(&mut h, 0x0023, &[]);
    push_extension(
        &mut h,
        0x0010,
        &[
            0x00, 0x0c, 0x02, b'h', b'2', 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1',
        ],
    );
    push_extension(&mut h, 0x0005, &[0x01, 0x00, 0x00, 0x00, 0x00]);
    push_extension(
        &mut h,
        0x000d,
        &[
            0x00, 0x10, 0x04, 0x03, 0x08, 0x04, 0x04, 0x01, 0x05, 0x03, 0x08, 0x05, 0x05, 0x01,
            0x08, 0x06, 0x06, 0x01,
        ],
    );
    let mut key_share = vec![0x00, 0x24, 0x00, 0x1d, 0x00, 0x20];
    let mut public = [0u8; 32];
    rng.fill_bytes(&mut public);
    key_share.extend_from_slice(&public);
    push_extension(&mut h, 0x0033, &key_share);
    push_extension(&mut h, 0x002d, &[0x01, 0x01]);
    push_extension(&mut h, 0x002b, &[0x04, 0x03, 0x04, 0x03, 0x03]);

    if h.len() + 4 > HELLO_LEN {
        return Err(ProbeError::Secret(format!(
            "fake-TLS domain too long ({} bytes)",
            name.len()
        )));
    }
    let padding = vec![0u8; HELLO_LEN - h.len() - 4];
    push_extension(&mut h, 0x0015, &padding);

    let extensions_len = (h.len() - extensions_at - 2) as u16;
    h[extensions_at..extensions_at + 2].copy_from_slice(&extensions_len.to_be_bytes());

    let digest = hello_digest(key, &h)?;
    h[RANDOM_OFFSET..RANDOM_OFFSET + 32].copy_from_slice(&digest);
    for (b, t) in h[RANDOM_OFFSET + 28..RANDOM_OFFSET + 32]
        .iter_mut()
        .zip(timestamp.to_le_bytes())
    {
        *b ^= t;
    }
    Ok(h)
}

pub(crate) fn hello_digest(key: &[u8], hello: &[u8]) -> Result<[u8; 32], ProbeError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| ProbeError::Secret("unusable fake-TLS key".into()))?;
    mac.update(hello);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn push_extension(h: &mut Vec<u8>, kind: u16, body: &[u8]) {
    h.extend_from_slice(&kind.to_be_bytes());
    h.extend_from_slice(&(body.len() as u16).to_be_bytes());
    h.extend_from_slice(body);
}

fn unix_time() -> u32 {
    ::time::OffsetDateTime::now_utc().unix_timestamp() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [7u8; 16];

    #[test]
    fn hello_has_fixed_length_and_prefix() {
        let h = client_hello(&KEY, "example.com", 1_700_000_000).unwrap();
        assert_eq!(h.len(), HELLO_LEN);
        assert_eq!(&h[..11], &HELLO_PREFIX);
        assert_eq!(h[43], 0x20);
        let ext_len = u16::from_be_bytes([h[112], h[113]]) as usize;
        assert_eq!(114 + ext_len, HELLO_LEN);
    }

    #[test]
    fn hello_random_is_keyed_digest_with_timestamp() {
        let ts = 1_700_000_123u32;
        let h = client_hello(&KEY, "example.com", ts).unwrap();
        let mut zeroed = h.clone();
        zeroed[RANDOM_OFFSET..RANDOM_OFFSET + 32].fill(0);
        let expected = hello_digest(&KEY, &zeroed).unwrap();
        assert_eq!(&h[RANDOM_OFFSET..RANDOM_OFFSET + 28], &expected[..28]);
        let mut stamp = [0u8; 4];
        for i in 0..4 {
            stamp[i] = h[RANDOM_OFFSET + 28 + i] ^ expected[28 + i];
        }
        assert_eq!(u32::from_le_bytes(stamp), ts);
    }

    #[test]
    fn hello_carries_sni() {
        let h = client_hello(&KEY, "cdn.example.net", 0).unwrap();
        let needle = b"cdn.example.net";
        assert!(h.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn overlong_domain_is_rejected() {
        let domain = "a".repeat(300);
        assert!(matches!(
            client_hello(&KEY, &domain, 0),
            Err(ProbeError::Secret(_))
        ));
    }
}
