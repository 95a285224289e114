//! Execution planner
//!
//! Turns a list of accounts into an ordered `ExecutionPlan`: tasks grouped
//! into windows, each with a delay and a fee multiplier. Planning is a pure
//! function of its inputs and the supplied RNG, so a seeded `StdRng` gives a
//! reproducible plan.

pub mod fees;
pub mod policy;

pub use fees::{CongestionLevel, FeeQuote, MarketConditions};
pub use policy::{DelayRange, FeeBehavior, FeePolicy, FrontRunProtection, TimingPolicy};

use crate::types::{
    Account, BundleId, BundleTask, ProcessorKind, TaskId, TaskStatus, TransactionTemplate,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lower bound for every planned delay
pub const MIN_TASK_DELAY_MS: u64 = 100;

/// Time-sliced group of tasks sharing a nominal start offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub index: usize,
    pub start_offset_ms: u64,
    pub task_ids: Vec<TaskId>,
}

/// Ordered tasks plus their window grouping. Consumed once by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub tasks: Vec<BundleTask>,
    pub windows: Vec<Window>,
    pub total_windows: usize,
    pub estimated_duration_ms: u64,
}

impl ExecutionPlan {
    pub fn empty() -> Self {
        Self {
            tasks: Vec::new(),
            windows: Vec::new(),
            total_windows: 0,
            estimated_duration_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Nominal start offset of a window
    pub fn window_offset_ms(&self, index: usize) -> u64 {
        self.windows
            .get(index)
            .map(|w| w.start_offset_ms)
            .unwrap_or(0)
    }
}

/// Per-bundle inputs of a planning run
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub bundle_id: BundleId,
    pub accounts: &'a [Account],
    pub template: &'a TransactionTemplate,
    pub processor: ProcessorKind,
    pub max_attempts: u32,
    pub market: MarketConditions,
}

/// Planner bound to validated policies
#[derive(Debug, Clone)]
pub struct Planner {
    timing: TimingPolicy,
    fees: FeePolicy,
}

impl Planner {
    /// Policies are validated here, never at plan time
    pub fn new(timing: TimingPolicy, fees: FeePolicy) -> crate::errors::EngineResult<Self> {
        timing.validate()?;
        fees.validate()?;
        Ok(Self { timing, fees })
    }

    pub fn timing(&self) -> &TimingPolicy {
        &self.timing
    }

    pub fn fees(&self) -> &FeePolicy {
        &self.fees
    }

    pub fn plan<R: Rng + ?Sized>(&self, ctx: &PlanContext<'_>, rng: &mut R) -> ExecutionPlan {
        if ctx.accounts.is_empty() {
            return ExecutionPlan::empty();
        }

        let quote = fees::quote(&self.fees, &ctx.market, ctx.template.base_fee);
        let mut tasks = Vec::with_capacity(ctx.accounts.len());
        let mut windows = Vec::new();
        let mut estimated_duration_ms = 0u64;

        for (index, chunk) in ctx
            .accounts
            .chunks(self.timing.wallets_per_window)
            .enumerate()
        {
            let start_offset_ms = index as u64 * self.timing.window_size_ms;
            let mut task_ids = Vec::with_capacity(chunk.len());

            for account in chunk {
                let delay_ms = sample_delay(&self.timing.delay_range, rng);
                estimated_duration_ms = estimated_duration_ms.max(start_offset_ms + delay_ms);

                let task = BundleTask {
                    id: TaskId::new(),
                    bundle_id: ctx.bundle_id,
                    account: account.clone(),
                    template: ctx.template.clone(),
                    delay_ms,
                    fee_multiplier: quote.multiplier,
                    window_index: index,
                    private_submission: quote.private_submission,
                    processor: ctx.processor,
                    attempt: 0,
                    max_attempts: ctx.max_attempts,
                    status: TaskStatus::Waiting,
                    last_error: None,
                    tx_hash: None,
                    fee_paid: None,
                    started_at: None,
                    finished_at: None,
                };
                task_ids.push(task.id);
                tasks.push(task);
            }

            windows.push(Window {
                index,
                start_offset_ms,
                task_ids,
            });
        }

        tracing::debug!(
            bundle_id = %ctx.bundle_id,
            tasks = tasks.len(),
            windows = windows.len(),
            congestion = ?quote.congestion,
            fee_multiplier = quote.multiplier,
            estimated_duration_ms,
            "Execution plan built"
        );

        ExecutionPlan {
            total_windows: windows.len(),
            tasks,
            windows,
            estimated_duration_ms,
        }
    }
}

/// Uniform sample from the delay range, floored at `MIN_TASK_DELAY_MS`
pub fn sample_delay<R: Rng + ?Sized>(range: &DelayRange, rng: &mut R) -> u64 {
    let (lo, hi) = if range.min <= range.max {
        (range.min, range.max)
    } else {
        (range.max, range.min)
    };
    rng.gen_range(lo..=hi).max(MIN_TASK_DELAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn accounts(n: usize) -> Vec<Account> {
        (0..n)
            .map(|i| Account::new(format!("acct-{i}"), format!("0x{i:040x}"), 1_000_000))
            .collect()
    }

    fn template() -> TransactionTemplate {
        TransactionTemplate {
            kind: TransactionKind::Transfer {
                recipient: Some("0xdead".to_string()),
                amount: 1,
            },
            base_fee: 10_000,
            gas_limit: None,
        }
    }

    fn planner(min: u64, max: u64, per_window: usize) -> Planner {
        Planner::new(
            TimingPolicy {
                delay_range: DelayRange { min, max },
                wallets_per_window: per_window,
                window_size_ms: 10_000,
            },
            FeePolicy::default(),
        )
        .unwrap()
    }

    fn ctx<'a>(accounts: &'a [Account], template: &'a TransactionTemplate) -> PlanContext<'a> {
        PlanContext {
            bundle_id: BundleId::new(),
            accounts,
            template,
            processor: ProcessorKind::Parallel,
            max_attempts: 3,
            market: MarketConditions { fee_rate: 10.0 },
        }
    }

    #[test]
    fn test_empty_plan() {
        let t = template();
        let plan = planner(300, 2000, 5).plan(&ctx(&[], &t), &mut StdRng::seed_from_u64(1));
        assert!(plan.is_empty());
        assert_eq!(plan.total_windows, 0);
        assert_eq!(plan.estimated_duration_ms, 0);
    }

    #[test]
    fn test_twelve_accounts_make_three_windows() {
        let accts = accounts(12);
        let t = template();
        let plan = planner(300, 2000, 5).plan(&ctx(&accts, &t), &mut StdRng::seed_from_u64(7));

        assert_eq!(plan.total_windows, 3);
        let sizes: Vec<usize> = plan.windows.iter().map(|w| w.task_ids.len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert_eq!(plan.window_offset_ms(2), 20_000);
        assert!(plan.tasks.iter().all(|t| (300..=2000).contains(&t.delay_ms)));
        assert!(plan.estimated_duration_ms >= 20_300);
    }

    #[test]
    fn test_same_seed_same_plan_shape() {
        let accts = accounts(8);
        let t = template();
        let p = planner(100, 5000, 3);
        let a = p.plan(&ctx(&accts, &t), &mut StdRng::seed_from_u64(42));
        let b = p.plan(&ctx(&accts, &t), &mut StdRng::seed_from_u64(42));
        let delays_a: Vec<u64> = a.tasks.iter().map(|t| t.delay_ms).collect();
        let delays_b: Vec<u64> = b.tasks.iter().map(|t| t.delay_ms).collect();
        assert_eq!(delays_a, delays_b);
    }

    #[test]
    fn test_order_follows_input() {
        let accts = accounts(6);
        let t = template();
        let plan = planner(300, 400, 4).plan(&ctx(&accts, &t), &mut StdRng::seed_from_u64(3));
        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.account.id.as_str()).collect();
        assert_eq!(ids, vec!["acct-0", "acct-1", "acct-2", "acct-3", "acct-4", "acct-5"]);
    }

    #[test]
    fn test_small_delays_floored() {
        let accts = accounts(4);
        let t = template();
        let plan = planner(0, 50, 2).plan(&ctx(&accts, &t), &mut StdRng::seed_from_u64(9));
        assert!(plan.tasks.iter().all(|t| t.delay_ms == MIN_TASK_DELAY_MS));
    }

    #[test]
    fn test_planner_rejects_invalid_policy() {
        let result = Planner::new(
            TimingPolicy {
                delay_range: DelayRange { min: 10, max: 1 },
                ..Default::default()
            },
            FeePolicy::default(),
        );
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn prop_windows_and_delays_bounded(
            n in 0usize..60,
            per_window in 1usize..10,
            min in 0u64..3000,
            span in 0u64..3000,
            seed in any::<u64>(),
        ) {
            let accts = accounts(n);
            let t = template();
            let plan = planner(min, min + span, per_window)
                .plan(&ctx(&accts, &t), &mut StdRng::seed_from_u64(seed));

            prop_assert_eq!(plan.tasks.len(), n);
            prop_assert_eq!(plan.total_windows, n.div_ceil(per_window));
            for task in &plan.tasks {
                prop_assert!(task.delay_ms >= MIN_TASK_DELAY_MS);
                prop_assert!(task.delay_ms >= min);
                prop_assert!(task.delay_ms <= (min + span).max(MIN_TASK_DELAY_MS));
                prop_assert!(task.fee_multiplier > 0.0);
            }
        }
    }
}
