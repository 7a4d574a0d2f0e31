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

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::loadbalance::LoadBalance;

/// Stateful index advancing modulo the current list length; the atomic
/// counter keeps it safe under concurrent callers.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalance for RoundRobin {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn select(&self, servers: &[String]) -> Option<String> {
        if servers.is_empty() {
            return None;
        }
        let value = self.counter.fetch_add(1, Ordering::SeqCst);
        servers.get(value % servers.len()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_round_robin_visits_each_server_exactly_twice() {
        let servers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let round_robin = RoundRobin::new();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..2 * servers.len() {
            let picked = round_robin.select(&servers).unwrap();
            *counts.entry(picked).or_default() += 1;
        }
        for addr in &servers {
            assert_eq!(counts[addr], 2);
        }
    }

    #[test]
    fn test_round_robin_on_empty_list() {
        assert!(RoundRobin::new().select(&[]).is_none());
    }
}
