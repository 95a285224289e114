//! Test fixtures shared by unit tests

use crate::types::{
    Account, BundleId, BundleTask, ProcessorKind, TaskId, TaskStatus, TransactionKind,
    TransactionTemplate,
};

pub fn transfer_template() -> TransactionTemplate {
    TransactionTemplate {
        kind: TransactionKind::Transfer {
            recipient: Some("0xrecipient".to_string()),
            amount: 1_000,
        },
        base_fee: 5_000,
        gas_limit: Some(21_000),
    }
}

pub fn sample_accounts(n: usize) -> Vec<Account> {
    (0..n)
        .map(|i| Account::new(format!("acct-{i}"), format!("0x{i:040x}"), 1_000_000))
        .collect()
}

pub fn sample_task(bundle_id: BundleId, processor: ProcessorKind) -> BundleTask {
    let id = TaskId::new();
    BundleTask {
        id,
        bundle_id,
        account: Account::new(format!("acct-{id}"), format!("0x{id}"), 1_000_000),
        template: transfer_template(),
        delay_ms: 100,
        fee_multiplier: 1.0,
        window_index: 0,
        private_submission: false,
        processor,
        attempt: 0,
        max_attempts: 3,
        status: TaskStatus::Waiting,
        last_error: None,
        tx_hash: None,
        fee_paid: None,
        started_at: None,
        finished_at: None,
    }
}
