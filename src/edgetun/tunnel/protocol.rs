use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::edgetun::tunnel::flow::Network;

/// Opaque signature that opens every edge data stream.
pub const PREAMBLE_SIGNATURE: [u8; 6] = [0x0A, 0x36, 0xCD, 0x12, 0xA1, 0x3E];
pub const PROTOCOL_VERSION: &[u8; 2] = b"01";

pub const MAX_CONNECT_JSON_BYTES: u32 = 64 * 1024;
pub const MAX_DATAGRAM_BYTES: u32 = 1 << 20; // 1 MiB

pub const META_STATUS: &str = "HttpStatus";
pub const META_WS_KEY: &str = "HttpHeader:Sec-Websocket-Key";
pub const META_WS_ACCEPT: &str = "HttpHeader:Sec-Websocket-Accept";
pub const META_FORWARD_DEST: &str = "HttpHeader:Forward-Dest";
pub const META_FORWARD_PROTO: &str = "HttpHeader:Forward-Proto";

/// HTTP header names carried by websocket upgrades.
pub const HEADER_FORWARD_DEST: &str = "Forward-Dest";
pub const HEADER_FORWARD_PROTO: &str = "Forward-Proto";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported version")]
    BadVersion,
    #[error("unexpected status {0:?}")]
    BadStatus(String),
    #[error("websocket accept key mismatch")]
    BadAcceptKey,
    #[error("connect rejected: {0}")]
    Rejected(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub key: String,
    pub val: String,
}

impl Metadata {
    pub fn new(key: impl Into<String>, val: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            val: val.into(),
        }
    }
}

fn lookup<'a>(metadata: &'a [Metadata], key: &str) -> Option<&'a str> {
    metadata
        .iter()
        .find(|m| m.key.eq_ignore_ascii_case(key))
        .map(|m| m.val.trim())
        .filter(|v| !v.is_empty())
}

/// A destination taken from connect metadata rather than a flow header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub network: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub dest: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

impl ConnectRequest {
    pub fn websocket(key: &str) -> Self {
        Self {
            dest: String::new(),
            kind: "websocket".into(),
            metadata: vec![Metadata::new(META_WS_KEY, key)],
        }
    }

    pub fn with_forward(mut self, network: Network, dest: &str) -> Self {
        self.metadata.push(Metadata::new(META_FORWARD_PROTO, network.as_str()));
        self.metadata.push(Metadata::new(META_FORWARD_DEST, dest));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        lookup(&self.metadata, key)
    }

    pub fn websocket_key(&self) -> &str {
        self.get(META_WS_KEY).unwrap_or("")
    }

    pub fn forward_target(&self) -> Option<ForwardTarget> {
        let network = self.get(META_FORWARD_PROTO)?;
        let address = self.get(META_FORWARD_DEST)?;
        Some(ForwardTarget {
            network: network.to_string(),
            address: address.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

impl ConnectResponse {
    pub fn switching_protocols(key: &str) -> Self {
        Self {
            error: String::new(),
            metadata: vec![
                Metadata::new(META_STATUS, "101"),
                Metadata::new("HttpHeader:Connection", "Upgrade"),
                Metadata::new(META_WS_ACCEPT, accept_key(key)),
                Metadata::new("HttpHeader:Upgrade", "websocket"),
            ],
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        lookup(&self.metadata, key)
    }
}

pub fn accept_key(key: &str) -> String {
    derive_accept_key(key.as_bytes())
}

async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    v: &T,
) -> Result<(), ProtocolError> {
    let b = serde_json::to_vec(v)?;
    let n: u32 = b
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_CONNECT_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    Ok(())
}

async fn read_json<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(
    r: &mut R,
) -> Result<T, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_CONNECT_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

async fn read_version<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    let mut ver = [0u8; 2];
    r.read_exact(&mut ver).await?;
    if &ver != PROTOCOL_VERSION {
        return Err(ProtocolError::BadVersion);
    }
    Ok(())
}

/// Consumes the stream preamble without interpreting it.
pub async fn read_preamble<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    let mut sig = [0u8; PREAMBLE_SIGNATURE.len()];
    r.read_exact(&mut sig).await?;
    Ok(())
}

pub async fn write_connect_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &ConnectRequest,
) -> Result<(), ProtocolError> {
    w.write_all(&PREAMBLE_SIGNATURE).await?;
    w.write_all(PROTOCOL_VERSION).await?;
    write_json(w, req).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the connect request that follows the preamble.
pub async fn read_connect_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ConnectRequest, ProtocolError> {
    read_version(r).await?;
    read_json(r).await
}

pub async fn write_connect_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    resp: &ConnectResponse,
) -> Result<(), ProtocolError> {
    w.write_all(&PREAMBLE_SIGNATURE).await?;
    w.write_all(PROTOCOL_VERSION).await?;
    write_json(w, resp).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the edge's answer and checks it accepted the upgrade for `key`.
pub async fn read_connect_response<R: AsyncRead + Unpin>(
    r: &mut R,
    key: &str,
) -> Result<ConnectResponse, ProtocolError> {
    read_preamble(r).await?;
    read_version(r).await?;
    let resp: ConnectResponse = read_json(r).await?;

    if !resp.error.trim().is_empty() {
        return Err(ProtocolError::Rejected(resp.error.trim().to_string()));
    }
    let status = resp.get(META_STATUS).unwrap_or("");
    if status != "101" {
        return Err(ProtocolError::BadStatus(status.to_string()));
    }
    if resp.get(META_WS_ACCEPT) != Some(accept_key(key).as_str()) {
        return Err(ProtocolError::BadAcceptKey);
    }
    Ok(resp)
}
