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

//! The call multiplexer: one physical connection serves many concurrent
//! logical calls. Sequence allocation and pending-table insertion happen in
//! one critical section before the request reaches the wire, so a response
//! can never race ahead of its registration. A single background task owns
//! all reads and is the sole path that propagates connection death to every
//! waiter.

use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use bytes::Bytes;
use crane_logger::tracing::debug;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::oneshot,
};

use crate::{
    codec::{BoxedCodecRead, BoxedCodecWrite, CodecRegistry, CodecType, ConnReader, ConnWriter},
    error::RpcError,
    protocol::{Header, Options, DEFAULT_RPC_PATH, MAGIC},
};

type CallResult = Result<Bytes, RpcError>;

struct State {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallResult>>,
    /// Set by `close`; further calls are refused.
    closing: bool,
    /// Terminal receive-loop error, once the connection is dead.
    shutdown: Option<String>,
}

struct Inner {
    codec_type: CodecType,
    writer: tokio::sync::Mutex<BoxedCodecWrite>,
    state: std::sync::Mutex<State>,
}

/// An RPC client bound to one connection. Cheap to clone; all clones share
/// the connection and its pending-call table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connects, performs the option handshake, and spawns the receive
    /// loop. The connect phase is bounded by `opt.connect_timeout` (zero
    /// disables the bound).
    pub async fn dial(addr: &str, opt: Options) -> Result<Client, RpcError> {
        Self::dial_with(addr, opt, &CodecRegistry::default()).await
    }

    pub async fn dial_with(
        addr: &str,
        opt: Options,
        codecs: &CodecRegistry,
    ) -> Result<Client, RpcError> {
        let stream = Self::connect(addr, &opt).await?;
        let (read, write) = stream.into_split();
        Self::handshake(BufReader::new(read), write, opt, codecs).await
    }

    /// Reaches the RPC protocol through a plain-text `CONNECT` upgrade on
    /// an HTTP-serving endpoint, then behaves identically to `dial`.
    pub async fn dial_http(addr: &str, opt: Options) -> Result<Client, RpcError> {
        Self::dial_http_with(addr, opt, &CodecRegistry::default()).await
    }

    pub async fn dial_http_with(
        addr: &str,
        opt: Options,
        codecs: &CodecRegistry,
    ) -> Result<Client, RpcError> {
        let stream = Self::connect(addr, &opt).await?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write
            .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n").as_bytes())
            .await?;

        let mut status = String::new();
        reader.read_line(&mut status).await?;
        if !status.contains("200") {
            return Err(RpcError::Protocol(format!(
                "unexpected CONNECT response: {}",
                status.trim_end()
            )));
        }
        // drain remaining response headers up to the blank line
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 || line.trim_end().is_empty() {
                break;
            }
        }

        Self::handshake(reader, write, opt, codecs).await
    }

    /// Dials an `protocol@host:port` style address: `http@` goes through
    /// the CONNECT upgrade, `tcp@` (or a bare address) is a raw dial.
    pub async fn dial_addr(rpc_addr: &str, opt: Options) -> Result<Client, RpcError> {
        match rpc_addr.split_once('@') {
            Some(("http", addr)) => Self::dial_http(addr, opt).await,
            Some(("tcp", addr)) => Self::dial(addr, opt).await,
            Some((scheme, _)) => Err(RpcError::Protocol(format!(
                "unsupported protocol scheme: {scheme}"
            ))),
            None => Self::dial(rpc_addr, opt).await,
        }
    }

    async fn connect(addr: &str, opt: &Options) -> Result<TcpStream, RpcError> {
        let stream = if opt.connect_timeout.is_zero() {
            TcpStream::connect(addr).await?
        } else {
            tokio::time::timeout(opt.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| RpcError::ConnectTimeout(opt.connect_timeout))??
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn handshake(
        reader: ConnReader,
        mut writer: ConnWriter,
        opt: Options,
        codecs: &CodecRegistry,
    ) -> Result<Client, RpcError> {
        if opt.magic != MAGIC {
            return Err(RpcError::Protocol(format!(
                "invalid magic number {:#x}",
                opt.magic
            )));
        }
        let ctor = codecs.get_codec(opt.codec_type).ok_or_else(|| {
            RpcError::Protocol(format!("unregistered codec type: {}", opt.codec_type))
        })?;

        let mut line = serde_json::to_vec(&opt).map_err(RpcError::codec)?;
        line.push(b'\n');
        writer.write_all(&line).await?;

        let (codec_read, codec_write) = ctor(reader, writer);
        let inner = Arc::new(Inner {
            codec_type: opt.codec_type,
            writer: tokio::sync::Mutex::new(codec_write),
            state: std::sync::Mutex::new(State {
                seq: 0,
                pending: HashMap::new(),
                closing: false,
                shutdown: None,
            }),
        });

        let recv_inner = inner.clone();
        tokio::spawn(async move {
            Inner::recv_loop(recv_inner, codec_read).await;
        });

        Ok(Client { inner })
    }

    /// Synchronous invocation: blocks until the matching response arrives
    /// or the connection fails. Application errors reported by the server
    /// surface as [`RpcError::Service`]. Callers bound the wait with
    /// `tokio::time::timeout`; dropping the future abandons the call and
    /// its late response is discarded by the receive loop.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self.inner.codec_type.encode(args)?;
        let reply = self.call_raw(service_method, body).await?;
        self.inner.codec_type.decode(&reply)
    }

    /// Pre-encoded variant of `call`; lets a broadcast encode its arguments
    /// once and fan the same bytes out to every server.
    ///
    /// The frame is written on a dedicated task, so cancelling this future
    /// abandons only the wait; it can never leave a partial frame on the
    /// shared connection.
    pub async fn call_raw(&self, service_method: &str, body: Bytes) -> Result<Bytes, RpcError> {
        let (seq, rx) = self.register(service_method)?;
        self.send(seq, service_method, body);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.inner.terminal_error()),
        }
    }

    /// Writes one request frame under the send lock, on its own task. A
    /// write failure fails this call only; stream death is the receive
    /// loop's call.
    fn send(&self, seq: u64, service_method: &str, body: Bytes) {
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = {
                let mut writer = inner.writer.lock().await;
                writer.write(&header, &body).await
            };
            if let Err(err) = result {
                let tx = inner.state.lock().unwrap().pending.remove(&seq);
                if let Some(tx) = tx {
                    let _ = tx.send(Err(err));
                }
            }
        });
    }

    /// Asynchronous invocation: returns immediately with a [`Call`] that
    /// resolves once the response arrives. Completion is delivered through
    /// a dedicated one-shot slot, so a slow caller can never block the
    /// receive loop.
    pub fn go<A, R>(&self, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = match self.inner.codec_type.encode(args) {
            Ok(body) => body,
            Err(err) => return Call::failed(service_method, err, self.inner.codec_type),
        };
        let (seq, rx) = match self.register(service_method) {
            Ok(registered) => registered,
            Err(err) => return Call::failed(service_method, err, self.inner.codec_type),
        };
        self.send(seq, service_method, body);

        Call {
            service_method: service_method.to_string(),
            codec_type: self.inner.codec_type,
            outcome: CallOutcome::Waiting(rx),
            _reply: PhantomData,
        }
    }

    /// Whether the connection is still usable: not closed by the owner and
    /// not torn down by a receive-loop failure.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.closing && state.shutdown.is_none()
    }

    /// Terminates the connection and fails every pending call with a
    /// closed-client error. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return;
            }
            state.closing = true;
            for (_, tx) in state.pending.drain() {
                let _ = tx.send(Err(RpcError::Shutdown));
            }
        }
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Allocates the next sequence number and registers the pending call
    /// under one lock, before anything is written.
    fn register(
        &self,
        service_method: &str,
    ) -> Result<(u64, oneshot::Receiver<CallResult>), RpcError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closing {
            return Err(RpcError::Shutdown);
        }
        if let Some(msg) = &state.shutdown {
            return Err(RpcError::ConnectionLost(msg.clone()));
        }
        state.seq += 1;
        let seq = state.seq;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        debug!(seq, service_method, "registered call");
        Ok((seq, rx))
    }
}

impl Inner {
    /// Owns all codec reads. Exits on the first read or decode failure,
    /// draining the pending table so every waiter observes the terminal
    /// error exactly once.
    async fn recv_loop(inner: Arc<Inner>, mut reader: BoxedCodecRead) {
        let err = loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(err) => break err,
            };
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(err) => break err,
            };
            let tx = inner.state.lock().unwrap().pending.remove(&header.seq);
            match tx {
                // call already abandoned; the body was consumed above, so
                // the stream stays in sync
                None => debug!(seq = header.seq, "response for unknown call discarded"),
                Some(tx) => {
                    let result = if header.error.is_empty() {
                        Ok(body)
                    } else {
                        Err(RpcError::Service(header.error))
                    };
                    let _ = tx.send(result);
                }
            }
        };
        debug!("client receive loop exit: {err}");
        inner.terminate(&err);
    }

    fn terminate(&self, err: &RpcError) {
        let mut state = self.state.lock().unwrap();
        let closing = state.closing;
        if state.shutdown.is_none() {
            state.shutdown = Some(err.to_string());
        }
        let msg = state.shutdown.clone().unwrap_or_default();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(if closing {
                RpcError::Shutdown
            } else {
                RpcError::ConnectionLost(msg.clone())
            }));
        }
    }

    fn terminal_error(&self) -> RpcError {
        let state = self.state.lock().unwrap();
        if state.closing {
            RpcError::Shutdown
        } else {
            RpcError::ConnectionLost(
                state
                    .shutdown
                    .clone()
                    .unwrap_or_else(|| "connection closed".to_string()),
            )
        }
    }
}

enum CallOutcome {
    /// Failed before it reached the wire.
    Failed(Option<RpcError>),
    Waiting(oneshot::Receiver<CallResult>),
}

/// An in-flight asynchronous invocation returned by [`Client::go`].
pub struct Call<R> {
    pub service_method: String,
    codec_type: CodecType,
    outcome: CallOutcome,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Call<R> {
    fn failed(service_method: &str, err: RpcError, codec_type: CodecType) -> Call<R> {
        Call {
            service_method: service_method.to_string(),
            codec_type,
            outcome: CallOutcome::Failed(Some(err)),
            _reply: PhantomData,
        }
    }

    /// Waits for completion and decodes the reply.
    pub async fn done(self) -> Result<R, RpcError> {
        match self.outcome {
            CallOutcome::Failed(err) => Err(err
                .unwrap_or_else(|| RpcError::ConnectionLost("call never started".to_string()))),
            CallOutcome::Waiting(rx) => {
                let body = rx
                    .await
                    .map_err(|_| RpcError::ConnectionLost("connection closed".to_string()))??;
                self.codec_type.decode(&body)
            }
        }
    }
}
