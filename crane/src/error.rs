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

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc: io error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake rejection: bad magic number or unsupported codec type.
    #[error("rpc: protocol error: {0}")]
    Protocol(String),

    /// Mid-stream encode/decode failure. Fatal for the connection.
    #[error("rpc: codec error: {0}")]
    Codec(String),

    #[error("rpc: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    /// The client was closed by its owner while the call was pending.
    #[error("rpc: client is shut down")]
    Shutdown,

    /// The connection died; carries the terminal receive-loop error.
    #[error("rpc: connection lost: {0}")]
    ConnectionLost(String),

    /// Application-level error reported by the server in the header.
    #[error("{0}")]
    Service(String),

    #[error("rpc: service already registered: {0}")]
    DuplicateService(String),

    #[error("rpc: service exposes no methods: {0}")]
    NoMethods(String),
}

impl RpcError {
    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        RpcError::Codec(err.to_string())
    }
}
