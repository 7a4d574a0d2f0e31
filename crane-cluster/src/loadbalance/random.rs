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

use rand::Rng;

use crate::loadbalance::LoadBalance;

#[derive(Debug, Default)]
pub struct Random;

impl LoadBalance for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, servers: &[String]) -> Option<String> {
        if servers.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..servers.len());
        servers.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_select_returns_a_member() {
        let servers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let random = Random;
        for _ in 0..100 {
            let picked = random.select(&servers).unwrap();
            assert!(servers.contains(&picked));
        }
    }

    #[test]
    fn test_random_select_on_empty_list() {
        assert!(Random.select(&[]).is_none());
    }
}
