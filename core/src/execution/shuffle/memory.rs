// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use crate::errors::{ShuffleError, ShuffleResult};
use datafusion::execution::memory_pool::{MemoryConsumer, MemoryReservation};
use datafusion::execution::runtime_env::RuntimeEnv;

/// Bytes buffered by one shuffle writer.
///
/// `limit` is the soft ceiling that triggers eviction. The reservation mirrors every buffered
/// byte in the runtime's memory pool, so a pool that cannot grant more memory shows up as an
/// allocation failure even while the soft ceiling is not reached.
#[derive(Debug)]
pub(crate) struct MemoryBudget {
    limit: usize,
    reservation: MemoryReservation,
}

impl MemoryBudget {
    pub(crate) fn new(name: String, limit: usize, runtime: &RuntimeEnv) -> Self {
        let reservation = MemoryConsumer::new(name)
            .with_can_spill(true)
            .register(&runtime.memory_pool);
        Self { limit, reservation }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn used(&self) -> usize {
        self.reservation.size()
    }

    pub(crate) fn exceeded(&self) -> bool {
        self.used() > self.limit
    }

    /// Reserves `bytes` from the memory pool.
    pub(crate) fn try_grow(&mut self, bytes: usize) -> ShuffleResult<()> {
        self.reservation
            .try_grow(bytes)
            .map_err(|e| ShuffleError::OutOfMemory(e.message().to_string()))
    }

    /// Returns `bytes` to the memory pool.
    pub(crate) fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.reservation.size());
        self.reservation.shrink(bytes);
    }

    pub(crate) fn free(&mut self) -> usize {
        self.reservation.free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;

    #[test]
    fn test_grow_and_shrink() {
        let runtime = RuntimeEnv::default();
        let mut budget = MemoryBudget::new("test".to_string(), 100, &runtime);
        budget.try_grow(60).unwrap();
        assert!(!budget.exceeded());
        budget.try_grow(60).unwrap();
        assert!(budget.exceeded());
        assert_eq!(120, budget.used());

        budget.shrink(1000);
        assert_eq!(0, budget.used());
        budget.try_grow(10).unwrap();
        assert_eq!(10, budget.free());
        assert_eq!(100, budget.limit());
    }

    #[test]
    fn test_pool_exhaustion_is_out_of_memory() {
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_limit(1024, 1.0)
            .build()
            .unwrap();
        let mut budget = MemoryBudget::new("test".to_string(), usize::MAX, &runtime);
        budget.try_grow(1000).unwrap();
        assert!(matches!(
            budget.try_grow(1000),
            Err(ShuffleError::OutOfMemory(_))
        ));
        assert_eq!(1000, budget.used());
    }
}
