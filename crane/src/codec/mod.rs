/*
 * Licensed to the Apache Software Foundation (ASF) under one or more
 * contributor license agreements.  See the NOTICE file distributed with
 * this work for additional information regarding copyright ownership.
 * The ASF licenses this file to You under the Apache License, Version 2.0
 * (the "License"); you may not use this file except in compliance with
 * the License.  You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Framing of (header, body) units onto a connection, with the encoding
//! selected during the option handshake.
//!
//! A codec owns one direction of the stream: the read half hands out
//! headers and raw body frames, the write half emits one header+body pair
//! as a single buffered write. Payload bytes inside a body frame are
//! encoded with the same serialization the codec uses for headers, via
//! [`CodecType::encode`] / [`CodecType::decode`], so both peers agree by
//! negotiation alone.

pub mod binary;
pub mod json;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};

use crate::{error::RpcError, protocol::Header};

pub use self::{binary::BinaryCodec, json::JsonCodec};

/// Upper bound on a single header or body frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// The buffered read half a codec is built over. Buffering is shared with
/// the handshake reader so no bytes are lost between the option line and
/// the first frame.
pub type ConnReader = BufReader<OwnedReadHalf>;
pub type ConnWriter = OwnedWriteHalf;

/// Selects a codec variant during the handshake and the serialization used
/// for argument/reply payloads on that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    /// Compact binary encoding (bincode).
    Binary,
    Json,
}

impl CodecType {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, RpcError> {
        let buf = match self {
            CodecType::Binary => bincode::serialize(value).map_err(RpcError::codec)?,
            CodecType::Json => serde_json::to_vec(value).map_err(RpcError::codec)?,
        };
        Ok(Bytes::from(buf))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, RpcError> {
        match self {
            CodecType::Binary => bincode::deserialize(bytes).map_err(RpcError::codec),
            CodecType::Json => serde_json::from_slice(bytes).map_err(RpcError::codec),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecType::Binary => write!(f, "binary"),
            CodecType::Json => write!(f, "json"),
        }
    }
}

/// Reads one direction of codec-framed traffic. A header always precedes
/// its body frame; the body is handed out raw and decoded by the caller.
#[async_trait]
pub trait CodecRead: Send {
    async fn read_header(&mut self) -> Result<Header, RpcError>;
    async fn read_body(&mut self) -> Result<Bytes, RpcError>;
}

/// Writes one direction of codec-framed traffic.
///
/// `write` emits the header and body as one unit. Callers sharing a
/// connection must serialize their writes externally (the client's and the
/// server's send locks); interleaved partial writes corrupt the stream.
#[async_trait]
pub trait CodecWrite: Send {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError>;
    async fn shutdown(&mut self) -> Result<(), RpcError>;
}

pub type BoxedCodecRead = Box<dyn CodecRead>;
pub type BoxedCodecWrite = Box<dyn CodecWrite>;

/// Builds both halves of a codec over a freshly handshaken connection.
pub type CodecCtor = fn(ConnReader, ConnWriter) -> (BoxedCodecRead, BoxedCodecWrite);

/// Maps codec types to constructors. An explicit dependency of both
/// [`crate::Server`] and [`crate::Client`] rather than a process-wide
/// table; `Default` knows the two built-in variants.
pub struct CodecRegistry {
    registry: DashMap<CodecType, CodecCtor>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let registry = CodecRegistry::empty();
        registry.registry.insert(CodecType::Binary, BinaryCodec::new as CodecCtor);
        registry.registry.insert(CodecType::Json, JsonCodec::new as CodecCtor);
        registry
    }
}

impl CodecRegistry {
    /// A registry with nothing registered. Pair with [`set_codec`] to expose
    /// a chosen subset of variants, or a replacement construction for one.
    ///
    /// [`set_codec`]: CodecRegistry::set_codec
    pub fn empty() -> Self {
        CodecRegistry {
            registry: DashMap::new(),
        }
    }

    pub fn get_codec(&self, codec_type: CodecType) -> Option<CodecCtor> {
        self.registry.get(&codec_type).map(|ctor| *ctor)
    }

    pub fn set_codec(&self, codec_type: CodecType, ctor: CodecCtor) -> Result<(), RpcError> {
        if self.registry.contains_key(&codec_type) {
            return Err(RpcError::Protocol(format!(
                "codec already registered: {codec_type}"
            )));
        }
        self.registry.insert(codec_type, ctor);
        Ok(())
    }

    pub fn is_registered(&self, codec_type: CodecType) -> bool {
        self.registry.contains_key(&codec_type)
    }
}

pub(crate) async fn read_frame(reader: &mut ConnReader) -> Result<Bytes, RpcError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Codec(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// One buffered write for the whole (header, body) unit.
pub(crate) async fn write_unit(
    writer: &mut ConnWriter,
    header_bytes: &[u8],
    body: &[u8],
) -> Result<(), RpcError> {
    let mut buf = Vec::with_capacity(8 + header_bytes.len() + body.len());
    buf.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(header_bytes);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn roundtrip(codec_type: CodecType) {
        let registry = CodecRegistry::default();
        let ctor = registry.get_codec(codec_type).unwrap();

        let (a, b) = tcp_pair().await;
        let (ar, aw) = a.into_split();
        let (br, bw) = b.into_split();
        let (_, mut wa) = ctor(BufReader::new(ar), aw);
        let (mut rb, _) = ctor(BufReader::new(br), bw);

        let header = Header {
            service_method: "Arith.Add".to_string(),
            seq: 7,
            error: String::new(),
        };
        let body = codec_type.encode(&(100i32, 200i32)).unwrap();
        wa.write(&header, &body).await.unwrap();

        let got = rb.read_header().await.unwrap();
        assert_eq!(got.service_method, "Arith.Add");
        assert_eq!(got.seq, 7);
        assert!(got.error.is_empty());

        let raw = rb.read_body().await.unwrap();
        let args: (i32, i32) = codec_type.decode(&raw).unwrap();
        assert_eq!(args, (100, 200));
    }

    #[tokio::test]
    async fn test_binary_codec_roundtrip() {
        roundtrip(CodecType::Binary).await;
    }

    #[tokio::test]
    async fn test_json_codec_roundtrip() {
        roundtrip(CodecType::Json).await;
    }

    #[tokio::test]
    async fn test_empty_body_frame() {
        let (a, b) = tcp_pair().await;
        let (ar, aw) = a.into_split();
        let (br, bw) = b.into_split();
        let (_, mut wa) = BinaryCodec::new(BufReader::new(ar), aw);
        let (mut rb, _) = BinaryCodec::new(BufReader::new(br), bw);

        let header = Header {
            service_method: "Arith.Div".to_string(),
            seq: 1,
            error: "division by zero".to_string(),
        };
        wa.write(&header, &[]).await.unwrap();

        let got = rb.read_header().await.unwrap();
        assert_eq!(got.error, "division by zero");
        assert!(rb.read_body().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tcp_pair().await;
        let (br, bw) = b.into_split();
        let (mut rb, _) = BinaryCodec::new(BufReader::new(br), bw);

        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = rb.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Codec(_)));
    }

    #[test]
    fn test_registry_rejects_duplicate() {
        let registry = CodecRegistry::default();
        assert!(registry.is_registered(CodecType::Json));
        assert!(registry.set_codec(CodecType::Json, JsonCodec::new).is_err());
    }

    #[test]
    fn test_empty_registry_accepts_new_registrations() {
        let registry = CodecRegistry::empty();
        assert!(!registry.is_registered(CodecType::Json));
        assert!(registry.get_codec(CodecType::Json).is_none());

        registry.set_codec(CodecType::Json, JsonCodec::new).unwrap();
        assert!(registry.get_codec(CodecType::Json).is_some());
        assert!(registry.set_codec(CodecType::Json, JsonCodec::new).is_err());
    }
}
