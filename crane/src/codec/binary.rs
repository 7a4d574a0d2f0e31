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

/// The compact binary codec: headers are bincode frames, bodies raw frames.
pub struct BinaryCodec;

pub struct BinaryCodecRead {
    reader: ConnReader,
}

pub struct BinaryCodecWrite {
    writer: ConnWriter,
}

impl BinaryCodec {
    pub fn new(reader: ConnReader, writer: ConnWriter) -> (BoxedCodecRead, BoxedCodecWrite) {
        (
            Box::new(BinaryCodecRead { reader }),
            Box::new(BinaryCodecWrite { writer }),
        )
    }
}

#[async_trait]
impl CodecRead for BinaryCodecRead {
    async fn read_header(&mut self) -> Result<Header, RpcError> {
        let frame = read_frame(&mut self.reader).await?;
        bincode::deserialize(&frame).map_err(RpcError::codec)
    }

    async fn read_body(&mut self) -> Result<Bytes, RpcError> {
        read_frame(&mut self.reader).await
    }
}

#[async_trait]
impl CodecWrite for BinaryCodecWrite {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError> {
        let header_bytes = bincode::serialize(header).map_err(RpcError::codec)?;
        write_unit(&mut self.writer, &header_bytes, body).await
    }

    async fn shutdown(&mut self) -> Result<(), RpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
