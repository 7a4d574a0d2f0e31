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

use serde::{Deserialize, Serialize};

use crate::codec::CodecType;

/// Identifies the wire protocol. A connection opening with any other value
/// is rejected during the handshake.
pub const MAGIC: u32 = 0x3bef5c;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Path answered by [`crate::Server::serve_http`] for the CONNECT upgrade.
pub const DEFAULT_RPC_PATH: &str = "/_crane_/rpc";

/// Connection-level negotiation record.
///
/// Sent exactly once, as a single JSON line, before any codec-framed
/// traffic. JSON is self-describing, so the receiving side can parse it
/// before it knows which codec the rest of the connection uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub magic: u32,
    pub codec_type: CodecType,
    /// Bound on establishing the connection. Zero disables the bound.
    #[serde(default)]
    pub connect_timeout: Duration,
    /// Server-side bound on handling one request. Zero runs untimed.
    #[serde(default)]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic: MAGIC,
            codec_type: CodecType::Binary,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn with_codec(codec_type: CodecType) -> Self {
        Options {
            codec_type,
            ..Options::default()
        }
    }
}

/// Per-call wire metadata. A header always precedes its body frame; the
/// sequence number is assigned by the client and echoed by the server.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    /// Empty means success; anything else is the call's error.
    pub error: String,
}
