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

//! A simple register center: it maintains the set of alive server
//! addresses and nothing else. Servers stay visible by heartbeating;
//! stale entries are evicted lazily while computing the alive list, not by
//! a background sweep.

use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crane_logger::tracing::{debug, error, info};
use hyper::{
    header::HeaderValue,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use thiserror::Error;
use tokio::task::JoinHandle;

pub const DEFAULT_PATH: &str = "/_crane_/registry";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Request header carrying one server address on a heartbeat POST.
pub const SERVER_HEADER: &str = "X-Crane-Server";
/// Response header carrying the comma-joined alive list on a GET.
pub const SERVERS_HEADER: &str = "X-Crane-Servers";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry: http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("registry: invalid uri: {0}")]
    Uri(#[from] http::uri::InvalidUri),
    #[error("registry: invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("registry: unexpected status: {0}")]
    BadStatus(StatusCode),
}

struct ServerItem {
    start: Instant,
}

/// The registry state: address -> last-heartbeat timestamp.
///
/// A timeout of zero disables expiry entirely.
pub struct Registry {
    timeout: Duration,
    path: String,
    servers: Mutex<HashMap<String, ServerItem>>,
}

impl Registry {
    pub fn new(timeout: Duration) -> Registry {
        Registry::with_path(timeout, DEFAULT_PATH)
    }

    pub fn with_path(timeout: Duration, path: &str) -> Registry {
        Registry {
            timeout,
            path: path.to_string(),
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts the address or refreshes its heartbeat timestamp.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap();
        match servers.get_mut(addr) {
            Some(item) => item.start = Instant::now(),
            None => {
                debug!(addr, "registry: new server");
                servers.insert(
                    addr.to_string(),
                    ServerItem {
                        start: Instant::now(),
                    },
                );
            }
        }
    }

    /// Returns the sorted alive list, evicting every entry whose last
    /// heartbeat is older than the registry timeout.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let timeout = self.timeout;
        let now = Instant::now();
        servers.retain(|addr, item| {
            let alive = timeout.is_zero() || now.duration_since(item.start) < timeout;
            if !alive {
                debug!(addr, "registry: evicted stale server");
            }
            alive
        });
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.uri().path() != self.path {
            return respond(StatusCode::NOT_FOUND);
        }
        match req.method() {
            &Method::GET => {
                let joined = self.alive_servers().join(",");
                match HeaderValue::from_str(&joined) {
                    Ok(value) => {
                        let mut resp = respond(StatusCode::OK);
                        resp.headers_mut().insert(SERVERS_HEADER, value);
                        resp
                    }
                    Err(_) => respond(StatusCode::INTERNAL_SERVER_ERROR),
                }
            }
            &Method::POST => {
                // keep it simple, the server address travels in a header
                match req
                    .headers()
                    .get(SERVER_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .filter(|addr| !addr.is_empty())
                {
                    Some(addr) => {
                        self.put_server(addr);
                        respond(StatusCode::OK)
                    }
                    None => respond(StatusCode::INTERNAL_SERVER_ERROR),
                }
            }
            _ => respond(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    /// Binds the HTTP endpoint (port 0 picks an ephemeral port) and
    /// returns the bound address together with the serving future.
    pub fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
    ) -> (SocketAddr, impl Future<Output = hyper::Result<()>>) {
        let registry = self;
        let make_service = make_service_fn(move |_conn| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(registry.handle(req)) }
                }))
            }
        });

        let server = hyper::Server::bind(&addr).serve(make_service);
        let local_addr = server.local_addr();
        info!(%local_addr, "registry: listening");
        (local_addr, server)
    }
}

fn respond(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

/// Registers `addr` with the registry and keeps it alive: one immediate
/// heartbeat (its failure is returned), then one per `period` until a send
/// fails, at which point the ticking stops for good. A zero period leaves
/// a one-minute margin before the default registry timeout.
pub async fn heartbeat(
    registry: String,
    addr: String,
    period: Duration,
) -> Result<JoinHandle<()>, RegistryError> {
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    let client = hyper::Client::new();
    send_heartbeat(&client, &registry, &addr).await?;

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // the immediate tick was consumed above
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&client, &registry, &addr).await {
                error!(%addr, "registry: heartbeat failed, stopping: {err}");
                return;
            }
        }
    }))
}

async fn send_heartbeat(
    client: &hyper::Client<hyper::client::HttpConnector>,
    registry: &str,
    addr: &str,
) -> Result<(), RegistryError> {
    debug!(addr, registry, "send heartbeat");
    let req = Request::post(registry)
        .header(SERVER_HEADER, addr)
        .body(Body::empty())?;
    let resp = client.request(req).await?;
    if resp.status() != StatusCode::OK {
        return Err(RegistryError::BadStatus(resp.status()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_refreshes_and_eviction_is_permanent() {
        let registry = Registry::new(Duration::from_millis(50));
        registry.put_server("tcp@127.0.0.1:9001");
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9001"]);

        std::thread::sleep(Duration::from_millis(80));
        assert!(registry.alive_servers().is_empty());
        // stays evicted until a fresh heartbeat
        assert!(registry.alive_servers().is_empty());

        registry.put_server("tcp@127.0.0.1:9001");
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9001"]);
    }

    #[test]
    fn test_zero_timeout_never_evicts() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("tcp@127.0.0.1:9001");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9001"]);
    }

    #[test]
    fn test_alive_list_is_sorted() {
        let registry = Registry::new(DEFAULT_TIMEOUT);
        registry.put_server("tcp@127.0.0.1:9002");
        registry.put_server("tcp@127.0.0.1:9001");
        assert_eq!(
            registry.alive_servers(),
            vec!["tcp@127.0.0.1:9001", "tcp@127.0.0.1:9002"]
        );
    }
}
