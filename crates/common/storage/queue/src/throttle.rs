// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rate limiting for repetitive error logs, keyed by category and queue.

use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

pub struct LogThrottle {
    limiter: DefaultKeyedRateLimiter<(String, String)>,
}

impl LogThrottle {
    pub fn per_second(burst: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::keyed(Quota::per_second(burst)),
        }
    }

    /// Whether a log line for `(category, key)` may be emitted now.
    pub fn allow(&self, category: &str, key: &str) -> bool {
        self.limiter
            .check_key(&(category.to_string(), key.to_string()))
            .is_ok()
    }
}

impl Default for LogThrottle {
    fn default() -> Self { Self::per_second(NonZeroU32::MIN) }
}

impl std::fmt::Debug for LogThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogThrottle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_per_key() {
        let throttle = LogThrottle::default();
        assert!(throttle.allow("readonly", "q1"));
        assert!(!throttle.allow("readonly", "q1"));
        assert!(throttle.allow("readonly", "q2"));
        assert!(throttle.allow("exiting", "q1"));
    }
}
