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

//! The request dispatcher: accepts connections, performs the option
//! handshake, and pumps request units off each connection. Every request
//! runs on its own task so a slow call cannot stall the connection, while
//! responses funnel back through one send lock. Handling is raced against
//! the negotiated handle timeout; the loser's result is discarded, never
//! written.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use crane_logger::tracing::{debug, error};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use crate::{
    codec::{BoxedCodecRead, BoxedCodecWrite, CodecRegistry, CodecType},
    error::RpcError,
    protocol::{Header, Options, DEFAULT_RPC_PATH, MAGIC},
    service::{MethodHandler, Service},
};

type SharedWriter = Arc<tokio::sync::Mutex<BoxedCodecWrite>>;

pub struct Server {
    codecs: CodecRegistry,
    services: DashMap<String, ()>,
    /// Flattened `Service.Method` -> handler dispatch table.
    methods: DashMap<String, Arc<MethodHandler>>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new(CodecRegistry::default())
    }
}

impl Server {
    pub fn new(codecs: CodecRegistry) -> Self {
        Server {
            codecs,
            services: DashMap::new(),
            methods: DashMap::new(),
        }
    }

    /// Exposes every method of `service` under its type name. Fails if the
    /// service exports no methods or the name is already taken.
    pub fn register(&self, service: impl Service) -> Result<(), RpcError> {
        let name = service.name();
        let methods = service.methods();
        if methods.is_empty() {
            return Err(RpcError::NoMethods(name.to_string()));
        }
        match self.services.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateService(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }
        for (method, handler) in methods {
            self.methods
                .insert(format!("{name}.{method}"), Arc::new(handler));
        }
        Ok(())
    }

    /// Accepts connections until the listener fails; each connection is
    /// served on its own task and failures stay contained to it.
    pub async fn accept(self: &Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "rpc server: accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_conn(stream).await {
                            debug!("rpc server: connection closed: {err}");
                        }
                    });
                }
                Err(err) => {
                    error!("rpc server: accept error: {err}");
                    return;
                }
            }
        }
    }

    /// Accepts connections that start with a plain-text
    /// `CONNECT /_crane_/rpc HTTP/1.0` upgrade; after the `200 Connected`
    /// response the stream runs the raw protocol.
    pub async fn serve_http(self: &Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "rpc server: accepted http connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_http_conn(stream).await {
                            debug!("rpc server: http connection closed: {err}");
                        }
                    });
                }
                Err(err) => {
                    error!("rpc server: accept error: {err}");
                    return;
                }
            }
        }
    }

    async fn serve_http_conn(self: Arc<Self>, stream: TcpStream) -> Result<(), RpcError> {
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        // drain request headers up to the blank line
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 || line.trim_end().is_empty() {
                break;
            }
        }

        let mut parts = request_line.split_whitespace();
        let ok = parts.next() == Some("CONNECT") && parts.next() == Some(DEFAULT_RPC_PATH);
        if !ok {
            write
                .write_all(b"HTTP/1.0 405 Method Not Allowed\r\n\r\n")
                .await?;
            return Err(RpcError::Protocol(format!(
                "rejected http request: {}",
                request_line.trim_end()
            )));
        }
        write
            .write_all(b"HTTP/1.0 200 Connected to CRANE RPC\r\n\r\n")
            .await?;

        self.serve_handshaken(reader, write).await
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream) -> Result<(), RpcError> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        self.serve_handshaken(BufReader::new(read), write).await
    }

    async fn serve_handshaken(
        self: Arc<Self>,
        mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        write: tokio::net::tcp::OwnedWriteHalf,
    ) -> Result<(), RpcError> {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let opt: Options = serde_json::from_str(&line)
            .map_err(|err| RpcError::Protocol(format!("invalid options record: {err}")))?;
        if opt.magic != MAGIC {
            return Err(RpcError::Protocol(format!(
                "invalid magic number {:#x}",
                opt.magic
            )));
        }
        let ctor = self.codecs.get_codec(opt.codec_type).ok_or_else(|| {
            RpcError::Protocol(format!("unregistered codec type: {}", opt.codec_type))
        })?;

        let (codec_read, codec_write) = ctor(reader, write);
        self.serve_codec(codec_read, codec_write, opt).await
    }

    /// Pumps request units until the stream ends or a decode error occurs.
    /// Unknown methods and handler errors answer with an error header and
    /// keep the connection open; only transport/decode failures end it.
    async fn serve_codec(
        self: Arc<Self>,
        mut reader: BoxedCodecRead,
        writer: BoxedCodecWrite,
        opt: Options,
    ) -> Result<(), RpcError> {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        loop {
            let header = reader.read_header().await?;
            let body = reader.read_body().await?;

            let server = self.clone();
            let writer = writer.clone();
            let codec_type = opt.codec_type;
            let handle_timeout = opt.handle_timeout;
            tokio::spawn(async move {
                server
                    .handle_request(header, body, codec_type, handle_timeout, writer)
                    .await;
            });
        }
    }

    async fn handle_request(
        &self,
        mut header: Header,
        body: Bytes,
        codec_type: CodecType,
        handle_timeout: Duration,
        writer: SharedWriter,
    ) {
        let handler = self
            .methods
            .get(&header.service_method)
            .map(|entry| entry.value().clone());

        let result = match handler {
            None => Err(RpcError::Service(format!(
                "can't find service/method {}",
                header.service_method
            ))),
            Some(handler) => Self::invoke(handler, codec_type, body, handle_timeout).await,
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                header.error = err.to_string();
                Bytes::new()
            }
        };

        let mut writer = writer.lock().await;
        if let Err(err) = writer.write(&header, &reply).await {
            error!(seq = header.seq, "rpc server: write response error: {err}");
        }
    }

    /// Races the handler against the handle timeout. On timeout the
    /// response is written immediately and the still-running handler is
    /// detached; its eventual result is dropped, so a late completion can
    /// never produce a second response on the wire.
    async fn invoke(
        handler: Arc<MethodHandler>,
        codec_type: CodecType,
        body: Bytes,
        handle_timeout: Duration,
    ) -> Result<Bytes, RpcError> {
        let fut = handler(codec_type, body);
        if handle_timeout.is_zero() {
            return fut.await;
        }

        let mut task = tokio::spawn(fut);
        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(err) => Err(RpcError::Service(format!("handler failed: {err}"))),
            },
            _ = tokio::time::sleep(handle_timeout) => Err(RpcError::HandleTimeout(handle_timeout)),
        }
    }
}
