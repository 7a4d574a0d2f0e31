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

//! The client-side answer to "which server addresses are currently
//! usable": either a fixed list, or a cache over the registry's alive
//! list refreshed on a TTL.

use std::{
    sync::{Mutex, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use crane_logger::tracing::debug;
use crane_registry::SERVERS_HEADER;
use hyper::StatusCode;

use crate::{
    error::ClusterError,
    loadbalance::{LoadBalance, Random, RoundRobin},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

/// The current set of candidate servers.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-reads the backing source, if there is one.
    async fn refresh(&self) -> Result<(), ClusterError>;
    /// Replaces the candidate list wholesale.
    async fn update(&self, servers: Vec<String>);
    /// One address chosen by the selection policy.
    async fn get(&self, mode: SelectMode) -> Result<String, ClusterError>;
    /// The full current address list.
    async fn get_all(&self) -> Result<Vec<String>, ClusterError>;
}

/// A manually supplied, fixed server set; `refresh` is a no-op.
pub struct MultiServerDiscovery {
    servers: RwLock<Vec<String>>,
    random: Random,
    round_robin: RoundRobin,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> MultiServerDiscovery {
        MultiServerDiscovery {
            servers: RwLock::new(servers),
            random: Random,
            round_robin: RoundRobin::new(),
        }
    }

    fn select(&self, mode: SelectMode) -> Result<String, ClusterError> {
        let servers = self.servers.read().unwrap();
        let picked = match mode {
            SelectMode::Random => self.random.select(&servers),
            SelectMode::RoundRobin => self.round_robin.select(&servers),
        };
        picked.ok_or(ClusterError::NoAvailableServers)
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        *self.servers.write().unwrap() = servers;
    }

    async fn get(&self, mode: SelectMode) -> Result<String, ClusterError> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self.servers.read().unwrap().clone())
    }
}

/// Discovery backed by the registry's HTTP endpoint. The alive list is
/// cached and only re-queried once its age exceeds `ttl`; a zero TTL
/// re-queries on every access.
pub struct RegistryDiscovery {
    servers: MultiServerDiscovery,
    registry: String,
    ttl: Duration,
    last_update: Mutex<Option<Instant>>,
    http: hyper::Client<hyper::client::HttpConnector>,
}

impl RegistryDiscovery {
    /// `registry` is the full endpoint URL, e.g.
    /// `http://127.0.0.1:9999/_crane_/registry`.
    pub fn new(registry: &str, ttl: Duration) -> RegistryDiscovery {
        RegistryDiscovery {
            servers: MultiServerDiscovery::new(Vec::new()),
            registry: registry.to_string(),
            ttl,
            last_update: Mutex::new(None),
            http: hyper::Client::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        let last_update = self.last_update.lock().unwrap();
        match *last_update {
            Some(at) => !self.ttl.is_zero() && at.elapsed() < self.ttl,
            None => false,
        }
    }

    fn mark_updated(&self) {
        *self.last_update.lock().unwrap() = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), ClusterError> {
        if self.is_fresh() {
            return Ok(());
        }
        debug!(registry = %self.registry, "refresh servers from registry");

        let resp = self.http.get(self.registry.parse()?).await?;
        if resp.status() != StatusCode::OK {
            return Err(ClusterError::Registry(format!(
                "registry answered {}",
                resp.status()
            )));
        }
        let servers = resp
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();

        self.servers.update(servers).await;
        self.mark_updated();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        self.servers.update(servers).await;
        self.mark_updated();
    }

    async fn get(&self, mode: SelectMode) -> Result<String, ClusterError> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, ClusterError> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multi_server_discovery_modes() {
        let discovery = MultiServerDiscovery::new(vec![
            "tcp@127.0.0.1:9001".to_string(),
            "tcp@127.0.0.1:9002".to_string(),
        ]);

        let all = discovery.get_all().await.unwrap();
        assert_eq!(all.len(), 2);

        let first = discovery.get(SelectMode::RoundRobin).await.unwrap();
        let second = discovery.get(SelectMode::RoundRobin).await.unwrap();
        assert_ne!(first, second);

        let picked = discovery.get(SelectMode::Random).await.unwrap();
        assert!(all.contains(&picked));
    }

    #[tokio::test]
    async fn test_empty_discovery_reports_no_servers() {
        let discovery = MultiServerDiscovery::new(Vec::new());
        assert!(matches!(
            discovery.get(SelectMode::Random).await,
            Err(ClusterError::NoAvailableServers)
        ));
    }

    #[tokio::test]
    async fn test_update_replaces_the_list() {
        let discovery = MultiServerDiscovery::new(vec!["tcp@old:1".to_string()]);
        discovery.update(vec!["tcp@new:1".to_string()]).await;
        assert_eq!(discovery.get_all().await.unwrap(), vec!["tcp@new:1"]);
    }
}
