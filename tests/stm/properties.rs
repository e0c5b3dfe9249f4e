//! Property Tests
//!
//! Random sequences of committed and abandoned transfers leave exactly the
//! committed ones applied, under both update policies.

use crate::*;
use proptest::prelude::*;
use static_assertions::{assert_impl_all, assert_not_impl_any};

assert_impl_all!(Engine: Send, Sync, Clone);
assert_impl_all!(TxObject<String>: Send, Sync, Clone);
assert_impl_all!(TxLock: Send, Sync);
assert_impl_all!(ThreadHandle: Send);
assert_not_impl_any!(ThreadHandle: Sync);
assert_impl_all!(Error: Send, Sync, Clone);

const ACCOUNTS: usize = 5;

#[derive(Debug, Clone)]
struct Transfer {
    from: usize,
    to: usize,
    amount: i64,
    commit: bool,
}

fn transfer() -> impl Strategy<Value = Transfer> {
    (0..ACCOUNTS, 0..ACCOUNTS, 1i64..100, any::<bool>()).prop_map(|(from, to, amount, commit)| {
        Transfer {
            from,
            to,
            amount,
            commit,
        }
    })
}

fn apply_all(update: UpdatePolicy, transfers: &[Transfer]) {
    let engine = engine_with(update, CommitValidation::Invalidation);
    let thread = engine.initialize_thread();
    let accounts: Vec<_> = (0..ACCOUNTS).map(|_| TxObject::new(0i64)).collect();
    let mut model = [0i64; ACCOUNTS];

    for t in transfers {
        let mut tx = thread.transaction().unwrap();
        *tx.write(&accounts[t.from]).unwrap() -= t.amount;
        *tx.write(&accounts[t.to]).unwrap() += t.amount;
        if t.commit {
            tx.end().unwrap();
            model[t.from] -= t.amount;
            model[t.to] += t.amount;
        } else {
            tx.abort().unwrap();
        }
    }

    for (account, expected) in accounts.iter().zip(model) {
        assert_eq!(account.load(), expected);
        assert_eq!(account.header().owner(), None);
    }
    assert_eq!(accounts.iter().map(|a| a.load()).sum::<i64>(), 0);
    let committed = transfers.iter().filter(|t| t.commit).count() as u64;
    assert_eq!(engine.stats().commits, committed);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_only_committed_transfers_apply_deferred(
        transfers in proptest::collection::vec(transfer(), 0..40)
    ) {
        apply_all(UpdatePolicy::Deferred, &transfers);
    }

    #[test]
    fn test_only_committed_transfers_apply_direct(
        transfers in proptest::collection::vec(transfer(), 0..40)
    ) {
        apply_all(UpdatePolicy::Direct, &transfers);
    }

    #[test]
    fn test_nested_families_commit_or_vanish_together(
        inner_ok in proptest::collection::vec(any::<bool>(), 1..6)
    ) {
        let engine = Engine::new();
        let thread = engine.initialize_thread();
        let x = TxObject::new(0u32);

        let mut outer = thread.transaction().unwrap();
        for ok in &inner_ok {
            let mut inner = thread.transaction().unwrap();
            // later writes fail once the family is doomed
            if let Ok(mut value) = inner.write(&x) {
                *value += 1;
            }
            if *ok {
                let _ = inner.end();
            } else {
                inner.abort().unwrap();
            }
        }
        let result = outer.end();

        if inner_ok.iter().all(|ok| *ok) {
            prop_assert!(result.is_ok());
            prop_assert_eq!(x.load(), inner_ok.len() as u32);
        } else {
            prop_assert_eq!(result, Err(Error::Aborted(AbortReason::NestedAbort)));
            prop_assert_eq!(x.load(), 0);
        }
    }
}
