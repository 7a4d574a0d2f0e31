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

//! A multiplexed RPC core: one physical connection carries many concurrent
//! logical calls, correlated by sequence number, framed by a codec that is
//! negotiated once per connection.

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;
pub mod service;

pub use client::{Call, Client};
pub use codec::{CodecRegistry, CodecType};
pub use error::RpcError;
pub use protocol::{Header, Options, MAGIC};
pub use server::Server;
pub use service::{method, MethodHandler, Service};
