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

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::{
    read_frame, write_unit, BoxedCodecRead, BoxedCodecWrite, CodecRead, CodecWrite, ConnReader,
    ConnWriter,
};
use crate::{error::RpcError, protocol::Header};

/// The JSON codec: headers are serde_json frames, bodies raw frames.
pub struct JsonCodec;

pub struct JsonCodecRead {
    reader: ConnReader,
}

pub struct JsonCodecWrite {
    writer: ConnWriter,
}

impl JsonCodec {
    pub fn new(reader: ConnReader, writer: ConnWriter) -> (BoxedCodecRead, BoxedCodecWrite) {
        (
            Box::new(JsonCodecRead { reader }),
            Box::new(JsonCodecWrite { writer }),
        )
    }
}

#[async_trait]
impl CodecRead for JsonCodecRead {
    async fn read_header(&mut self) -> Result<Header, RpcError> {
        let frame = read_frame(&mut self.reader).await?;
        serde_json::from_slice(&frame).map_err(RpcError::codec)
    }

    async fn read_body(&mut self) -> Result<Bytes, RpcError> {
        read_frame(&mut self.reader).await
    }
}

#[async_trait]
impl CodecWrite for JsonCodecWrite {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError> {
        let header_bytes = serde_json::to_vec(header).map_err(RpcError::codec)?;
        write_unit(&mut self.writer, &header_bytes, body).await
    }

    async fn shutdown(&mut self) -> Result<(), RpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
