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

use crane::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("cluster: no available servers")]
    NoAvailableServers,

    #[error("cluster: registry error: {0}")]
    Registry(String),

    #[error("cluster: http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("cluster: invalid registry uri: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    /// A broadcast leg cut short after another server already failed.
    #[error("cluster: call cancelled after first failure")]
    Cancelled,
}
