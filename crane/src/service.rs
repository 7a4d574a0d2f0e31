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

//! The service directory contract: a registrable service exposes its
//! invocable methods as a name -> handler table, no runtime reflection
//! involved. Argument and reply shapes are fixed per method; the [`method`]
//! adapter does the decode/encode at the boundary.

use std::{collections::HashMap, future::Future, pin::Pin};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{codec::CodecType, error::RpcError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes, RpcError>> + Send>>;

/// One invocable method: takes the connection's negotiated serialization
/// and the raw argument bytes, returns the encoded reply or an error that
/// travels back in the response header.
pub type MethodHandler = Box<dyn Fn(CodecType, Bytes) -> HandlerFuture + Send + Sync>;

/// A registrable service object.
///
/// `methods` enumerates every externally invocable method; the server
/// flattens the table under `Name.Method` keys at registration time.
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn methods(&self) -> HashMap<&'static str, MethodHandler>;
}

/// Lifts a typed async function into a [`MethodHandler`].
///
/// Decode failure of the arguments is reported as a codec error for this
/// call only; the connection stays open.
pub fn method<A, R, F, Fut>(f: F) -> MethodHandler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(A) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
{
    Box::new(move |codec_type: CodecType, body: Bytes| {
        let f = f.clone();
        Box::pin(async move {
            let args: A = codec_type.decode(&body)?;
            let reply = f(args).await?;
            codec_type.encode(&reply)
        })
    })
}
