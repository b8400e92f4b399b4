//! LLM budget & concurrency gate (`llm:*` keys).
//!
//! Two independent controls sit in front of every LLM call an agent makes:
//! a counting semaphore bounding in-flight calls, and a daily dollar budget
//! that refuses new *slots* once exceeded. An in-flight call is always let
//! to finish — the budget gates starting new work, never cancels work
//! already underway.

use crate::error::CoordError;
use crate::ids::AgentId;
use crate::kv::{keys, KvBackend};
use crate::models::LlmCostEntry;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LlmBudget {
    kv: Arc<dyn KvBackend>,
    max_concurrent: i64,
    daily_dollar_cap: Option<f64>,
}

impl LlmBudget {
    pub fn new(kv: Arc<dyn KvBackend>, max_concurrent: i64, daily_dollar_cap: Option<f64>) -> Self {
        Self {
            kv,
            max_concurrent,
            daily_dollar_cap,
        }
    }

    async fn spent_today(&self) -> Result<f64> {
        // A single running total rather than a per-day key: the core does
        // not itself roll the counter over at midnight (no clock-driven
        // background task owns that), so callers that need real calendar
        // days should reset via `reset_daily_spend`.
        let raw = self.kv.get(keys::LLM_SEMAPHORE_SPEND).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0.0))
    }

    /// Acquire one concurrency slot, failing fast if the semaphore is full
    /// or the daily budget is already exceeded. Returns a [`LlmSlot`] that
    /// must be released (directly or via `Drop`) to free the slot.
    pub async fn acquire_slot(self: &Arc<Self>) -> Result<LlmSlot> {
        if let Some(cap) = self.daily_dollar_cap {
            let spent = self.spent_today().await?;
            if spent >= cap {
                return Err(CoordError::BudgetExceeded(format!(
                            "daily LLM spend {spent:.2} exceeds cap {cap:.2}"
                )));
            }
        }

        let in_flight = self.kv.incr(keys::LLM_SEMAPHORE).await?;
        if in_flight > self.max_concurrent {
            self.kv.decr(keys::LLM_SEMAPHORE).await?;
            return Err(CoordError::BudgetExceeded(format!(
                        "LLM concurrency limit {} reached",
                        self.max_concurrent
            )));
        }
        debug!(in_flight, "llm slot acquired");
        Ok(LlmSlot {
                budget: self.clone(),
                released: false,
        })
    }

    async fn release_slot(&self) -> Result<()> {
        self.kv.decr(keys::LLM_SEMAPHORE).await?;
        Ok(())
    }

    /// Record actual spend for a completed call, attributing it to `model`
    /// and (optionally) the calling agent. Returns the model's running
    /// totals after this call is folded in.
    pub async fn record_cost(&self, model: &str, agent_id: Option<AgentId>, tokens: u64, dollars: f64) -> Result<LlmCostEntry> {
        let tokens_total = self.kv.hincrby(&keys::llm_costs_tokens(model), "total", tokens as i64).await?;
        let dollars_cents_total = self
        .kv
        .hincrby(&keys::llm_costs_dollars(model), "total", (dollars * 100.0).round() as i64)
        .await?;
        let spend_raw = self.kv.incrby(keys::LLM_SEMAPHORE_SPEND_CENTS, (dollars * 100.0).round() as i64).await?;
        self.kv
        .set(keys::LLM_SEMAPHORE_SPEND, &((spend_raw as f64) / 100.0).to_string())
        .await?;
        if let Some(agent_id) = agent_id {
            self.kv
            .hincrby(&keys::llm_costs_by_agent(agent_id), model, tokens as i64)
            .await?;
        }
        Ok(LlmCostEntry {
                model: model.to_string(),
                agent_id,
                tokens: tokens_total as u64,
                dollars: dollars_cents_total as f64 / 100.0,
        })
    }

    /// Resets the running daily total. Intended to be called by whatever
    /// scheduled task owns calendar-day rollover in a deployment.
    pub async fn reset_daily_spend(&self) -> Result<()> {
        self.kv.set(keys::LLM_SEMAPHORE_SPEND, "0").await?;
        self.kv.set(keys::LLM_SEMAPHORE_SPEND_CENTS, "0").await?;
        Ok(())
    }
}

/// RAII guard for one concurrency slot. Released on `Drop` best-effort
/// (fire-and-forget, matching [`crate::locks::ScopedLock`]'s pattern) or
/// deterministically via [`LlmSlot::release`].
pub struct LlmSlot {
    budget: Arc<LlmBudget>,
    released: bool,
}

impl LlmSlot {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.budget.release_slot().await
    }
}

impl Drop for LlmSlot {
    fn drop(&mut self) {
        if !self.released {
            let budget = self.budget.clone();
            tokio::spawn(async move {
                    if let Err(e) = budget.release_slot().await {
                        warn!(error = %e, "best-effort llm slot release failed");
                    }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileBackend;

    async fn budget(max_concurrent: i64, cap: Option<f64>) -> Arc<LlmBudget> {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        Arc::new(LlmBudget::new(kv, max_concurrent, cap))
    }

    #[tokio::test]
    async fn slot_acquisition_respects_concurrency_cap() {
        let budget = budget(1, None).await;
        let slot1 = budget.acquire_slot().await.unwrap();
        let err = budget.acquire_slot().await.unwrap_err();
        assert!(matches!(err, CoordError::BudgetExceeded(_)));
        slot1.release().await.unwrap();
        assert!(budget.acquire_slot().await.is_ok());
    }

    #[tokio::test]
    async fn dollar_cap_blocks_new_slots_not_in_flight_work() {
        let budget = budget(10, Some(1.0)).await;
        let slot = budget.acquire_slot().await.unwrap();
        budget.record_cost("gpt", None, 1000, 1.50).await.unwrap();
        let err = budget.acquire_slot().await.unwrap_err();
        assert!(matches!(err, CoordError::BudgetExceeded(_)));
        // The slot already held is unaffected by the budget breach.
        slot.release().await.unwrap();
    }

    #[tokio::test]
    async fn slot_releases_on_drop() {
        let budget = budget(1, None).await;
        {
            let _slot = budget.acquire_slot().await.unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(budget.acquire_slot().await.is_ok());
    }
}
