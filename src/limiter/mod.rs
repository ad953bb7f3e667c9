//! Request throttling and the per-run circuit breaker.
//!
//! Every upstream request goes through [`RateLimiter::call`]: budget check,
//! sliding-window slot, counter increment, then a bounded retry loop driven by
//! [`retry::classify`].

pub mod retry;

pub use retry::{classify, FailureClass, RetryPolicy};

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ApiConfig;
use crate::error::{HarvestError, Result};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter with a per-run request budget.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: usize,
    window: VecDeque<Instant>,
    budget: u32,
    daily_quota: u32,
    used_today_before_run: u32,
    session_requests: u32,
    retry: RetryPolicy,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, budget: u32, retry: RetryPolicy) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1) as usize,
            window: VecDeque::new(),
            budget,
            daily_quota: 0,
            used_today_before_run: 0,
            session_requests: 0,
            retry,
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(
            config.requests_per_minute,
            config.request_budget_per_run,
            RetryPolicy::from_config(config),
        )
        .with_daily_usage(config.daily_quota, 0)
    }

    /// Account for requests already spent today by earlier runs. A quota of 0
    /// disables the daily check.
    pub fn with_daily_usage(mut self, daily_quota: u32, used_today: u32) -> Self {
        self.daily_quota = daily_quota;
        self.used_today_before_run = used_today;
        self
    }

    /// Wait until a slot is free under the per-minute ceiling, then take it.
    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            while let Some(&oldest) = self.window.front() {
                if now.duration_since(oldest) >= WINDOW {
                    self.window.pop_front();
                } else {
                    break;
                }
            }
            if self.window.len() < self.requests_per_minute {
                self.window.push_back(now);
                return;
            }
            if let Some(&oldest) = self.window.front() {
                let wake = oldest + WINDOW;
                log::debug!(
                    "Rate limit: {} requests in the last minute, waiting {:?}",
                    self.window.len(),
                    wake.saturating_duration_since(now)
                );
                tokio::time::sleep_until(wake).await;
            }
        }
    }

    /// Count one issued request against the run budget.
    pub fn record_request(&mut self) {
        self.session_requests = self.session_requests.saturating_add(1);
    }

    /// True once the run budget (or today's quota) is spent. Never resets within a run.
    pub fn should_stop(&self) -> bool {
        if self.session_requests >= self.budget {
            return true;
        }
        self.daily_quota > 0
            && self.used_today_before_run.saturating_add(self.session_requests) >= self.daily_quota
    }

    pub fn session_requests(&self) -> u32 {
        self.session_requests
    }

    /// Requests still allowed in this run.
    pub fn remaining(&self) -> u32 {
        let by_budget = self.budget.saturating_sub(self.session_requests);
        if self.daily_quota == 0 {
            return by_budget;
        }
        let used = self.used_today_before_run.saturating_add(self.session_requests);
        by_budget.min(self.daily_quota.saturating_sub(used))
    }

    /// Issue one logical request with throttling, budget accounting and retries.
    ///
    /// Every attempt counts against the budget. Retryable failures back off per
    /// the policy; once the bound is reached (or the budget runs out) the last
    /// error is returned for the caller to classify. Refuses with
    /// `BudgetExhausted` when no budget is left before the first attempt.
    pub async fn call<T, F, Fut>(&mut self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.should_stop() {
                return Err(HarvestError::BudgetExhausted(self.session_requests));
            }
            self.acquire().await;
            self.record_request();

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = classify(&err);
            match self.retry.delay_for(class, attempt) {
                Some(delay) if !self.should_stop() => {
                    log::warn!(
                        "{} failed ({:?}), retry {}/{} in {:?}: {}",
                        label,
                        class,
                        attempt + 1,
                        self.retry.max_retries,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err(err),
            }
        }
    }
}
