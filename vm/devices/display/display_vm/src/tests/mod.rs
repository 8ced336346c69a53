// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Session tests driven through [`DisplayVm`].


use crate::DisplayVm;
use crate::Error;
use crate::HrmEvent;
use crate::Mismatch;
use crate::NotifyOutcome;
use crate::Resource;
use crate::VmRoleKind;
use display_vm_defs::config::DisplayVmConfig;
use display_vm_defs::config::RequestAction;
use display_vm_defs::CommitState;
use display_vm_defs::IoRange;
use display_vm_defs::IrqLabel;
use display_vm_defs::NotificationCookie;
use display_vm_defs::RequestState;
use display_vm_defs::SglDesc;
use mock::MockHrm;
use mock::TestClient;
use std::sync::Arc;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub(crate) fn trusted_sgl() -> SglDesc {
    SglDesc::new(vec![IoRange::try_new(0x2a0_0000..0x2b0_0000).unwrap()]).unwrap()
}

const CONFIG: &str = r#"{
    "trusted_vm": 45,
    "primary": { "irqs": [ { "label": 7, "irq": 42 }, { "label": 9, "irq": 55 } ] },
    "trusted": {
        "irqs": [ { "label": 7, "irq": 42 }, { "label": 9, "irq": 55 } ],
        "io_ranges": [ { "base": 44040192, "size": 1048576 } ]
    },
    "request_policy": {
        "transitions": [
            { "from": 0, "to": 1, "requires": "owned", "action": "release" },
            { "from": 1, "to": 2, "requires": "not_owned", "action": "acquire" },
            { "from": 2, "to": 0 }
        ]
    }
}"#;

const IDLE: RequestState = RequestState(0);
const HANDOFF: RequestState = RequestState(1);
const TAKEOVER: RequestState = RequestState(2);

fn config() -> DisplayVmConfig {
    DisplayVmConfig::from_json(CONFIG).unwrap()
}

fn trusted() -> (Arc<MockHrm>, DisplayVm) {
    init_tracing();
    let hrm = MockHrm::new();
    let vm = DisplayVm::new(hrm.clone(), config());
    vm.init_trusted();
    (hrm, vm)
}

fn primary() -> (Arc<MockHrm>, DisplayVm) {
    init_tracing();
    let hrm = MockHrm::new();
    let vm = DisplayVm::new(hrm.clone(), config());
    vm.init_primary();
    (hrm, vm)
}

fn commit(sequence: u64) -> CommitState {
    CommitState { sequence }
}

fn pending_cookie(vm: &DisplayVm) -> NotificationCookie {
    vm.lock().unwrap().ledger().notification_cookie().unwrap()
}

#[test]
fn trusted_acquire_and_release() {
    let (hrm, vm) = trusted();
    let mut lock = vm.lock().unwrap();
    assert_eq!(lock.kind(), VmRoleKind::Trusted);
    assert!(!lock.ops().owns_hw());

    lock.ops().acquire().unwrap();
    assert!(lock.ops().owns_hw());
    assert_eq!(lock.ledger().held_irq_count(), 2);
    assert!(lock.ledger().io_mem_handle().is_some());
    assert!(lock.ledger().notification_cookie().is_some());
    assert_eq!(hrm.lent_irq_labels(), [IrqLabel(7), IrqLabel(9)]);
    assert_eq!(hrm.lent_mem_count(), 1);
    assert_eq!(hrm.notifier_count(), 1);

    // Acquiring again changes nothing.
    lock.ops().acquire().unwrap();
    assert_eq!(hrm.lent_mem_count(), 1);

    lock.ops().release().unwrap();
    assert!(!lock.ops().owns_hw());
    assert!(lock.ledger().is_clear());
    assert!(hrm.lent_irq_labels().is_empty());
    assert_eq!(hrm.lent_mem_count(), 0);
    assert_eq!(hrm.notifier_count(), 0);
}

#[test]
fn stale_notification_is_dropped() {
    let (hrm, vm) = trusted();
    vm.lock().unwrap().ops().acquire().unwrap();
    let calls = hrm.calls().len();

    let outcome = vm
        .notify(NotificationCookie(0xdead), HrmEvent::Revoked)
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::Dropped);

    let mut lock = vm.lock().unwrap();
    assert!(lock.ops().owns_hw());
    assert_eq!(lock.ledger().held_irq_count(), 2);
    assert_eq!(hrm.calls().len(), calls);
}

#[test]
fn revoked_trusted_session() {
    let (hrm, vm) = trusted();
    vm.lock().unwrap().ops().acquire().unwrap();

    let cookie = pending_cookie(&vm);
    assert_eq!(
        vm.notify(cookie, HrmEvent::Accepted).unwrap(),
        NotifyOutcome::Applied
    );
    assert!(vm.lock().unwrap().ops().owns_hw());

    assert_eq!(
        vm.notify(cookie, HrmEvent::Revoked).unwrap(),
        NotifyOutcome::Applied
    );
    let mut lock = vm.lock().unwrap();
    let mut ops = lock.ops();
    assert!(!ops.owns_hw());
    assert!(matches!(
        ops.prepare_commit(&commit(1)),
        Err(Error::OwnershipViolation)
    ));
    assert!(matches!(ops.acquire(), Err(Error::ResourcesOutstanding)));

    ops.release().unwrap();
    assert!(ops.ledger().is_clear());
    assert!(hrm.lent_irq_labels().is_empty());
}

#[test]
fn busy_client_blocks_release() {
    let (hrm, vm) = trusted();
    let client = TestClient::new("kms");
    let _handle = vm.clients().register(client.clone());
    vm.lock().unwrap().ops().acquire().unwrap();
    assert_eq!(client.post_acquire_count(), 1);

    client.set_busy(true);
    let mut lock = vm.lock().unwrap();
    assert!(matches!(
        lock.ops().release(),
        Err(Error::ClientNotReady(name)) if name == "kms"
    ));
    assert!(lock.ops().owns_hw());
    assert_eq!(lock.ledger().held_irq_count(), 2);
    assert!(lock.ledger().notification_cookie().is_some());
    assert_eq!(client.pre_release_count(), 0);
    assert!(hrm.calls().iter().all(|call| !call.is_reclaim()));

    client.set_busy(false);
    lock.ops().release().unwrap();
    assert_eq!(client.pre_release_count(), 1);
    assert!(lock.ledger().is_clear());
}

#[test]
fn failed_pre_release_keeps_resources() {
    let (hrm, vm) = trusted();
    let client = TestClient::new("compositor");
    let _handle = vm.clients().register(client.clone());
    let mut lock = vm.lock().unwrap();
    lock.ops().acquire().unwrap();

    client.fail_pre_release(true);
    assert!(matches!(lock.ops().release(), Err(Error::Client { .. })));
    assert!(lock.ops().owns_hw());
    assert_eq!(hrm.lent_mem_count(), 1);
}

#[test]
fn failed_pre_release_resumes_clients() {
    let (_hrm, vm) = trusted();
    let first = TestClient::new("kms");
    let second = TestClient::new("compositor");
    let _handles = [
        vm.clients().register(first.clone()),
        vm.clients().register(second.clone()),
    ];
    let mut lock = vm.lock().unwrap();
    lock.ops().acquire().unwrap();
    assert_eq!(first.post_acquire_count(), 1);

    second.fail_pre_release(true);
    assert!(matches!(
        lock.ops().release(),
        Err(Error::Client { ref name, .. }) if name == "compositor"
    ));
    assert!(lock.ops().owns_hw());
    assert_eq!(first.pre_release_count(), 1);
    assert_eq!(first.post_acquire_count(), 2);
    lock.unlock();

    let (_hrm, vm) = primary();
    let first = TestClient::new("kms");
    let second = TestClient::new("compositor");
    second.fail_pre_release(true);
    let _handles = [
        vm.clients().register(first.clone()),
        vm.clients().register(second.clone()),
    ];
    let mut lock = vm.lock().unwrap();
    assert!(lock.ops().release().is_err());
    assert!(lock.ops().owns_hw());
    assert!(lock.ledger().notification_cookie().is_none());
    assert_eq!(first.pre_release_count(), 1);
    assert_eq!(first.post_acquire_count(), 1);
}

#[test]
fn commits_require_ownership() {
    let (_hrm, vm) = trusted();
    let mut lock = vm.lock().unwrap();
    let mut ops = lock.ops();
    assert!(matches!(
        ops.prepare_commit(&commit(1)),
        Err(Error::OwnershipViolation)
    ));

    ops.acquire().unwrap();
    ops.prepare_commit(&commit(2)).unwrap();
    ops.post_commit(&commit(2)).unwrap();
    ops.release().unwrap();
    assert!(matches!(
        ops.post_commit(&commit(3)),
        Err(Error::OwnershipViolation)
    ));

    let (_hrm, vm) = primary();
    let mut lock = vm.lock().unwrap();
    let mut ops = lock.ops();
    ops.prepare_commit(&commit(1)).unwrap();
    ops.release().unwrap();
    assert!(matches!(
        ops.prepare_commit(&commit(2)),
        Err(Error::OwnershipViolation)
    ));
}

#[test]
fn memory_lend_failure_rolls_back_irqs() {
    let (hrm, vm) = trusted();
    hrm.fail_mem_lend(true);
    let mut lock = vm.lock().unwrap();

    assert!(matches!(
        lock.ops().acquire(),
        Err(Error::ResourceLendFailure(Resource::IoMemory, _))
    ));
    assert!(!lock.ops().owns_hw());
    assert!(lock.ledger().is_clear());
    assert!(!lock.ledger().is_poisoned());
    assert!(hrm.lent_irq_labels().is_empty());

    hrm.fail_mem_lend(false);
    lock.ops().acquire().unwrap();
    assert!(lock.ops().owns_hw());
}

#[test]
fn unrecoverable_rollback_poisons_acquire() {
    let (hrm, vm) = trusted();
    hrm.fail_mem_lend(true);
    hrm.withhold_on_reclaim(Some(IrqLabel(9)));
    let mut lock = vm.lock().unwrap();

    let err = lock.ops().acquire().unwrap_err();
    assert!(err.is_session_fatal());
    assert!(matches!(err, Error::ResourceMismatch(Mismatch::Irqs { .. })));
    assert!(lock.ledger().is_poisoned());
    assert!(matches!(lock.ops().acquire(), Err(Error::Poisoned)));
    lock.unlock();

    hrm.fail_mem_lend(false);
    hrm.withhold_on_reclaim(None);
    vm.init_trusted();
    assert!(hrm.lent_irq_labels().is_empty());
    vm.lock().unwrap().ops().acquire().unwrap();
}

#[test]
fn client_failure_rolls_back_acquire() {
    let (hrm, vm) = trusted();
    let client = TestClient::new("kms");
    client.fail_post_acquire(true);
    let _handle = vm.clients().register(client.clone());
    let mut lock = vm.lock().unwrap();

    assert!(matches!(
        lock.ops().acquire(),
        Err(Error::Client { ref name, .. }) if name == "kms"
    ));
    assert!(lock.ledger().is_clear());
    assert!(hrm.lent_irq_labels().is_empty());
    assert_eq!(hrm.lent_mem_count(), 0);
    assert_eq!(hrm.notifier_count(), 0);
}

#[test]
fn reclaim_mismatch_poisons_until_reinit() {
    let (hrm, vm) = trusted();
    let mut lock = vm.lock().unwrap();
    lock.ops().acquire().unwrap();

    hrm.withhold_on_reclaim(Some(IrqLabel(9)));
    let err = lock.ops().release().unwrap_err();
    assert!(err.is_session_fatal());
    assert!(matches!(err, Error::ResourceMismatch(Mismatch::Irqs { .. })));
    assert_eq!(lock.ledger().held_irq_count(), 2);
    assert!(!lock.ops().owns_hw());
    assert!(matches!(lock.ops().acquire(), Err(Error::Poisoned)));
    assert!(matches!(lock.ops().release(), Err(Error::Poisoned)));
    lock.unlock();

    hrm.withhold_on_reclaim(None);
    vm.init_trusted();
    assert!(hrm.lent_irq_labels().is_empty());

    let mut lock = vm.lock().unwrap();
    assert!(!lock.ledger().is_poisoned());
    lock.ops().acquire().unwrap();
    assert!(lock.ops().owns_hw());
}

#[test]
fn swapped_memory_handle_poisons() {
    let (hrm, vm) = trusted();
    let mut lock = vm.lock().unwrap();
    lock.ops().acquire().unwrap();

    hrm.swap_mem_handle(true);
    assert!(matches!(
        lock.ops().release(),
        Err(Error::ResourceMismatch(Mismatch::Memory { .. }))
    ));
    assert!(lock.ledger().is_poisoned());
}

#[test]
fn concurrent_acquire_and_release() {
    let (hrm, vm) = trusted();
    let vm = Arc::new(vm);

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let vm = vm.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    vm.active_ops(|ops| {
                        if ops.owns_hw() {
                            ops.release()
                        } else {
                            ops.acquire()
                        }
                    })
                    .unwrap()
                    .unwrap();
                    let stale = NotificationCookie(0xf000 + i);
                    assert_eq!(
                        vm.notify(stale, HrmEvent::Revoked).unwrap(),
                        NotifyOutcome::Dropped
                    );
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert!(!hrm.overlapped());
    let lock = vm.lock().unwrap();
    assert_eq!(lock.ledger().held_irq_count(), hrm.lent_irq_labels().len());
    assert_eq!(
        lock.ledger().io_mem_handle().is_some(),
        hrm.lent_mem_count() == 1
    );
}

#[test]
fn concurrent_revocations() {
    let (hrm, vm) = trusted();
    let vm = Arc::new(vm);

    // Ownership changes and notifications only touch the resource manager
    // under the session lock, so the two sets of books must agree whenever
    // the lock is held.
    let books_agree = {
        let hrm = hrm.clone();
        move |ops: &crate::VmOps<'_>| {
            let ledger = ops.ledger();
            assert_eq!(ledger.held_irq_count(), hrm.lent_irq_labels().len());
            assert_eq!(ledger.io_mem_handle().is_some(), hrm.lent_mem_count() == 1);
            assert_eq!(
                ledger.notification_cookie().is_some(),
                hrm.notifier_count() == 1
            );
        }
    };

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let vm = vm.clone();
            let books_agree = books_agree.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let cookie = vm
                        .active_ops(|ops| {
                            books_agree(&*ops);
                            if ops.owns_hw() || !ops.ledger().is_clear() {
                                ops.release().unwrap();
                            } else {
                                ops.acquire().unwrap();
                            }
                            books_agree(&*ops);
                            ops.ledger().notification_cookie()
                        })
                        .unwrap();
                    if let Some(cookie) = cookie {
                        // The session may have moved on by now.
                        vm.notify(cookie, HrmEvent::Revoked).unwrap();
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    assert!(!hrm.overlapped());

    let mut lock = vm.lock().unwrap();
    if lock.ledger().is_clear() {
        lock.ops().acquire().unwrap();
    }
    let cookie = lock.ledger().notification_cookie().unwrap();
    lock.unlock();
    assert_eq!(
        vm.notify(cookie, HrmEvent::Revoked).unwrap(),
        NotifyOutcome::Applied
    );
    vm.active_ops(|ops| {
        assert!(!ops.owns_hw());
        ops.release().unwrap();
        books_agree(&*ops);
        assert!(ops.ledger().is_clear());
    })
    .unwrap();
}

#[test]
fn primary_release_and_return() {
    let (hrm, vm) = primary();
    let client = TestClient::new("kms");
    let _handle = vm.clients().register(client.clone());

    {
        let mut lock = vm.lock().unwrap();
        assert_eq!(lock.kind(), VmRoleKind::Primary);
        assert!(lock.ops().owns_hw());
        lock.ops().release().unwrap();
        assert!(!lock.ops().owns_hw());
        assert_eq!(client.pre_release_count(), 1);
        assert_eq!(hrm.notifier_count(), 1);
        assert!(matches!(
            lock.ops().acquire(),
            Err(Error::ResourcesOutstanding)
        ));
    }

    let cookie = pending_cookie(&vm);
    assert_eq!(
        vm.notify(cookie, HrmEvent::Accepted).unwrap(),
        NotifyOutcome::Applied
    );
    let returned = HrmEvent::Returned {
        irqs: vec![IrqLabel(9), IrqLabel(7)],
    };
    assert_eq!(vm.notify(cookie, returned).unwrap(), NotifyOutcome::Applied);
    assert_eq!(hrm.notifier_count(), 0);

    // The cookie is spent.
    let again = HrmEvent::Returned {
        irqs: vec![IrqLabel(7), IrqLabel(9)],
    };
    assert_eq!(vm.notify(cookie, again).unwrap(), NotifyOutcome::Dropped);

    let mut lock = vm.lock().unwrap();
    lock.ops().acquire().unwrap();
    assert!(lock.ops().owns_hw());
    assert_eq!(client.post_acquire_count(), 1);
}

#[test]
fn primary_rejects_partial_return() {
    let (_hrm, vm) = primary();
    vm.lock().unwrap().ops().release().unwrap();

    let cookie = pending_cookie(&vm);
    let err = vm
        .notify(
            cookie,
            HrmEvent::Returned {
                irqs: vec![IrqLabel(7)],
            },
        )
        .unwrap_err();
    assert!(err.is_session_fatal());

    let mut lock = vm.lock().unwrap();
    assert!(lock.ledger().is_poisoned());
    assert!(matches!(lock.ops().acquire(), Err(Error::Poisoned)));
}

#[test]
fn primary_release_aborts_without_notifier() {
    let (hrm, vm) = primary();
    let client = TestClient::new("kms");
    let _handle = vm.clients().register(client.clone());
    hrm.fail_notifier(true);

    let mut lock = vm.lock().unwrap();
    assert!(matches!(
        lock.ops().release(),
        Err(Error::ResourceLendFailure(Resource::Notifier, _))
    ));
    assert!(lock.ops().owns_hw());
    assert_eq!(client.pre_release_count(), 1);
    assert_eq!(client.post_acquire_count(), 1);
}

#[test]
fn deinit_is_idempotent() {
    let (hrm, vm) = trusted();
    vm.lock().unwrap().ops().acquire().unwrap();
    let cookie = pending_cookie(&vm);
    assert!(vm.is_enabled());

    vm.deinit();
    assert!(!vm.is_enabled());
    assert!(vm.lock().is_none());
    assert!(hrm.lent_irq_labels().is_empty());
    assert_eq!(hrm.lent_mem_count(), 0);
    assert_eq!(hrm.notifier_count(), 0);

    let calls = hrm.calls().len();
    vm.deinit();
    assert_eq!(hrm.calls().len(), calls);
    assert_eq!(
        vm.notify(cookie, HrmEvent::Revoked).unwrap(),
        NotifyOutcome::Dropped
    );
    assert!(vm.active_ops(|ops| ops.acquire()).is_none());
}

#[test]
fn role_switch_tears_down_old_role() {
    let (hrm, vm) = trusted();
    vm.lock().unwrap().ops().acquire().unwrap();

    vm.init_primary();
    assert!(hrm.lent_irq_labels().is_empty());
    assert_eq!(hrm.lent_mem_count(), 0);
    assert_eq!(hrm.notifier_count(), 0);
    let lock = vm.lock().unwrap();
    assert_eq!(lock.kind(), VmRoleKind::Primary);
    assert!(lock.ledger().is_clear());
}

#[test]
fn drop_returns_resources() {
    let (hrm, vm) = trusted();
    vm.lock().unwrap().ops().acquire().unwrap();
    drop(vm);
    assert!(hrm.lent_irq_labels().is_empty());
    assert_eq!(hrm.lent_mem_count(), 0);
}

#[test]
fn requests_drive_ownership() {
    let (_hrm, vm) = trusted();
    let mut lock = vm.lock().unwrap();
    let mut ops = lock.ops();

    assert!(matches!(
        ops.apply_request(IDLE, HANDOFF),
        Err(Error::InvalidTransition { .. })
    ));
    ops.request_valid(HANDOFF, TAKEOVER).unwrap();
    assert!(ops.request_valid(TAKEOVER, HANDOFF).is_err());

    assert_eq!(
        ops.apply_request(HANDOFF, TAKEOVER).unwrap(),
        RequestAction::Acquire
    );
    assert!(ops.owns_hw());
    assert_eq!(
        ops.apply_request(TAKEOVER, IDLE).unwrap(),
        RequestAction::None
    );
    assert!(ops.owns_hw());
    assert_eq!(
        ops.apply_request(IDLE, HANDOFF).unwrap(),
        RequestAction::Release
    );
    assert!(!ops.owns_hw());
}

#[test]
fn empty_policy_rejects_every_request() {
    init_tracing();
    let mut config = config();
    config.request_policy.transitions.clear();
    let vm = DisplayVm::new(MockHrm::new(), config);
    vm.init_primary();

    let result = vm.active_ops(|ops| ops.request_valid(IDLE, HANDOFF)).unwrap();
    assert!(matches!(result, Err(Error::InvalidTransition { .. })));
}
