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

//! A discovery-aware client that pools one [`Client`] per server address,
//! picks targets through the configured selection policy, and fans calls
//! out to every discovered server when asked to broadcast.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use crane::{protocol::Options, Client};
use crane_logger::tracing::debug;
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, watch};

use crate::{
    discovery::{Discovery, SelectMode},
    error::ClusterError,
};

/// One server's result within a broadcast, tagged with where it came from.
pub struct CallOutcome<R> {
    pub server: String,
    pub service_method: String,
    pub result: Result<R, ClusterError>,
}

struct XInner {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opt: Options,
    /// Established connections keyed by `protocol@addr`. Entries that went
    /// stale are replaced on the next dial.
    clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<XInner>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opt: Options) -> XClient {
        XClient {
            inner: Arc::new(XInner {
                discovery,
                mode,
                opt,
                clients: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the pooled connection for `rpc_addr`, dialing on a miss.
    /// A pooled connection that has since died is dropped and re-dialed.
    async fn dial(&self, rpc_addr: &str) -> Result<Client, ClusterError> {
        let mut clients = self.inner.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            debug!(rpc_addr, "dropping stale pooled connection");
            let stale = clients.remove(rpc_addr);
            if let Some(stale) = stale {
                stale.close().await;
            }
        }
        let client = Client::dial_addr(rpc_addr, self.inner.opt.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    /// Calls on one server picked by the selection policy.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClusterError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.inner.discovery.get(self.inner.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Calls on one specific server, bypassing selection.
    pub async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
    ) -> Result<R, ClusterError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self
            .inner
            .opt
            .codec_type
            .encode(args)
            .map_err(ClusterError::from)?;
        let reply = self.call_addr_raw(rpc_addr, service_method, body).await?;
        self.decode(&reply)
    }

    async fn call_addr_raw(
        &self,
        rpc_addr: &str,
        service_method: &str,
        body: Bytes,
    ) -> Result<Bytes, ClusterError> {
        let client = self.dial(rpc_addr).await?;
        Ok(client.call_raw(service_method, body).await?)
    }

    fn decode<R: DeserializeOwned>(&self, body: &Bytes) -> Result<R, ClusterError> {
        Ok(self.inner.opt.codec_type.decode(body)?)
    }

    /// Fire-and-collect variant of [`XClient::call`]: the outcome arrives on
    /// the returned channel instead of blocking the caller.
    pub fn async_call<A, R>(&self, service_method: &str, args: &A) -> mpsc::Receiver<CallOutcome<R>>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let encoded = self.inner.opt.codec_type.encode(args);
        let xclient = self.clone();
        let service_method = service_method.to_string();
        tokio::spawn(async move {
            let result = match encoded {
                Ok(body) => match xclient.inner.discovery.get(xclient.inner.mode).await {
                    Ok(rpc_addr) => {
                        let reply = xclient
                            .call_addr_raw(&rpc_addr, &service_method, body)
                            .await
                            .and_then(|reply| xclient.decode(&reply));
                        return send_outcome(&tx, rpc_addr, service_method, reply).await;
                    }
                    Err(err) => Err(err),
                },
                Err(err) => Err(ClusterError::from(err)),
            };
            send_outcome(&tx, String::new(), service_method, result).await;
        });
        rx
    }

    /// Invokes `service_method` on every discovered server at once. The
    /// arguments are encoded a single time and the same bytes fan out to
    /// each connection.
    ///
    /// The first failure wins and cancels the legs still in flight; with no
    /// failure, the first successful reply is the result. Either way every
    /// leg is awaited before returning.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClusterError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.inner.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(ClusterError::NoAvailableServers);
        }
        let body = self
            .inner
            .opt
            .codec_type
            .encode(args)
            .map_err(ClusterError::from)?;

        // (first non-cancelled error, first successful reply)
        let race: std::sync::Mutex<(Option<ClusterError>, Option<Bytes>)> =
            std::sync::Mutex::new((None, None));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let legs = servers.iter().map(|rpc_addr| {
            let mut cancel_rx = cancel_rx.clone();
            let body = body.clone();
            let race = &race;
            let cancel_tx = &cancel_tx;
            async move {
                let result = tokio::select! {
                    result = self.call_addr_raw(rpc_addr, service_method, body) => result,
                    _ = cancel_rx.changed() => Err(ClusterError::Cancelled),
                };
                match result {
                    Ok(reply) => {
                        let mut race = race.lock().unwrap();
                        if race.1.is_none() {
                            race.1 = Some(reply);
                        }
                    }
                    Err(ClusterError::Cancelled) => {}
                    Err(err) => {
                        let mut race = race.lock().unwrap();
                        if race.0.is_none() {
                            debug!(%rpc_addr, "broadcast leg failed, cancelling the rest");
                            race.0 = Some(err);
                            let _ = cancel_tx.send(true);
                        }
                    }
                }
            }
        });
        join_all(legs).await;

        let (first_error, first_reply) = {
            let mut race = race.lock().unwrap();
            (race.0.take(), race.1.take())
        };
        match first_error {
            Some(err) => Err(err),
            None => match first_reply {
                Some(reply) => self.decode(&reply),
                None => Err(ClusterError::NoAvailableServers),
            },
        }
    }

    /// Broadcast that reports every server's outcome individually instead
    /// of racing to a single result. The channel holds one slot per
    /// discovered server; no leg cancels any other.
    pub async fn async_broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
    ) -> mpsc::Receiver<CallOutcome<R>>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let prepared = match self.inner.discovery.get_all().await {
            Ok(servers) => self
                .inner
                .opt
                .codec_type
                .encode(args)
                .map(|body| (servers, body))
                .map_err(ClusterError::from),
            Err(err) => Err(err),
        };
        let (servers, body) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                let (tx, rx) = mpsc::channel(1);
                send_outcome::<R>(&tx, String::new(), service_method.to_string(), Err(err)).await;
                return rx;
            }
        };

        let (tx, rx) = mpsc::channel(servers.len().max(1));
        for rpc_addr in servers {
            let xclient = self.clone();
            let body = body.clone();
            let tx = tx.clone();
            let service_method = service_method.to_string();
            tokio::spawn(async move {
                let result = xclient
                    .call_addr_raw(&rpc_addr, &service_method, body)
                    .await
                    .and_then(|reply| xclient.decode(&reply));
                send_outcome(&tx, rpc_addr, service_method, result).await;
            });
        }
        rx
    }

    /// Closes every pooled connection and empties the pool.
    pub async fn close(&self) {
        let mut clients = self.inner.clients.lock().await;
        for (_, client) in clients.drain() {
            client.close().await;
        }
    }
}

async fn send_outcome<R>(
    tx: &mpsc::Sender<CallOutcome<R>>,
    server: String,
    service_method: String,
    result: Result<R, ClusterError>,
) {
    let _ = tx
        .send(CallOutcome {
            server,
            service_method,
            result,
        })
        .await;
}
