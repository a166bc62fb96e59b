// SPDX-License-Identifier: MIT OR Apache-2.0
//! Budget gates: how the pipeline claims a slot under the daily cap.
//!
//! `execute` plugs in a [`ReservingGate`] whose claim is the atomic counter
//! update; `evaluate` plugs in a [`PeekGate`] so dry runs report budget
//! state without consuming it.

use apg_store::{CounterStore, StoreError};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;

/// One attempt to claim a budget slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetClaim {
    /// Count after the claim, when it succeeded.
    pub count: Option<u64>,
    /// Whether the claim actually incremented the counter.
    pub reserved: bool,
}

/// Strategy for claiming a slot under `cap` on `date`.
#[async_trait]
pub trait BudgetGate: Send + Sync {
    /// Attempt the claim. `count` is `None` when the cap is exhausted.
    async fn claim(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
        cap: u64,
    ) -> Result<BudgetClaim, StoreError>;
}

/// Gate that performs the real atomic reservation.
pub struct ReservingGate {
    counters: Arc<dyn CounterStore>,
}

impl ReservingGate {
    /// Build over a counter store.
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }
}

#[async_trait]
impl BudgetGate for ReservingGate {
    async fn claim(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
        cap: u64,
    ) -> Result<BudgetClaim, StoreError> {
        let count = self.counters.reserve_slot(org_id, uapk_id, date, cap).await?;
        Ok(BudgetClaim {
            reserved: count.is_some(),
            count,
        })
    }
}

/// Read-only gate for dry runs: reports what a reservation would have
/// returned without touching the counter.
pub struct PeekGate {
    counters: Arc<dyn CounterStore>,
}

impl PeekGate {
    /// Build over a counter store.
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }
}

#[async_trait]
impl BudgetGate for PeekGate {
    async fn claim(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
        cap: u64,
    ) -> Result<BudgetClaim, StoreError> {
        let current = self.counters.counter_value(org_id, uapk_id, date).await?;
        if current >= cap {
            return Ok(BudgetClaim {
                count: None,
                reserved: false,
            });
        }
        Ok(BudgetClaim {
            count: Some(current + 1),
            reserved: false,
        })
    }
}
