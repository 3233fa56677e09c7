mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use aero_hba::{CompletionReason, DeviceMetadata, PresenceState, RawStatus, Submission, Throttle};
use common::{config, payload, Harness, PresenceCall};

const DISK: DeviceMetadata = DeviceMetadata {
    wwn: 0x5000_c500_1234_5678,
    max_luns: 8,
};

#[test]
fn removal_during_online_waits_for_the_online_work() {
    let h = Harness::new(config());
    h.adapter.on_device_added(2, DISK).unwrap();
    h.adapter.on_device_removed(2).unwrap();

    let snap = h.adapter.get_target_state(2).unwrap();
    assert_eq!(snap.presence, PresenceState::PreOfflineTimeoutNoCancel);
    // The online work still needs the device, so nothing is held back.
    assert_eq!(snap.throttle, Throttle::Max);
    assert_eq!(
        h.adapter.submit(h.sink.command(2, 0)).unwrap(),
        Submission::Accepted
    );

    // The offline delay runs out while the online work is still pending.
    h.ticks(3);
    assert_eq!(
        h.adapter.get_target_state(2).unwrap().presence,
        PresenceState::PreOfflineTimeoutNoCancel
    );
    assert!(h.presence.calls().is_empty());

    // Online runs first; the deferred offline is scheduled as it finishes.
    assert_eq!(h.runner.run_pending(&h.adapter), 2);
    assert_eq!(
        h.presence.calls(),
        vec![PresenceCall::Online(2), PresenceCall::Offline(2)]
    );

    let snap = h.adapter.get_target_state(2).unwrap();
    assert_eq!(snap.presence, PresenceState::Inactive);
    assert!(snap.gone);
    // The command already in flight is left to the transport.
    assert_eq!(snap.in_flight, 1);

    h.adapter.submit(h.sink.command(2, 1)).unwrap();
    assert_eq!(h.sink.reasons(), vec![CompletionReason::DeviceGone]);
}

#[test]
fn online_finishing_first_falls_back_to_the_offline_countdown() {
    let h = Harness::new(config());
    h.adapter.on_device_added(1, DISK).unwrap();
    h.adapter.on_device_removed(1).unwrap();

    assert_eq!(h.runner.run_pending(&h.adapter), 1);
    let snap = h.adapter.get_target_state(1).unwrap();
    assert_eq!(snap.presence, PresenceState::PreOfflineTimeout);
    assert_eq!(snap.throttle, Throttle::Hold);
    assert!(!snap.gone);

    h.ticks(3);
    assert_eq!(
        h.adapter.get_target_state(1).unwrap().presence,
        PresenceState::OfflineInProgress
    );
    assert_eq!(h.runner.run_pending(&h.adapter), 1);
    assert_eq!(
        h.presence.calls(),
        vec![PresenceCall::Online(1), PresenceCall::Offline(1)]
    );
    assert!(h.adapter.get_target_state(1).unwrap().gone);
}

#[test]
fn device_returning_cancels_the_pending_offline() {
    let h = Harness::new(config());
    h.adapter.on_device_removed(1).unwrap();
    assert_eq!(
        h.adapter.get_target_state(1).unwrap().throttle,
        Throttle::Hold
    );
    assert_eq!(
        h.adapter.submit(h.sink.command(1, 0)).unwrap(),
        Submission::Queued
    );

    h.ticks(1);
    h.adapter.on_device_added(1, DISK).unwrap();
    // Admission reopens immediately.
    assert_eq!(h.transport.submitted().len(), 1);

    // Past the original offline delay, short of the command timeout.
    h.ticks(4);
    assert_eq!(h.runner.run_pending(&h.adapter), 1);
    assert_eq!(h.presence.calls(), vec![PresenceCall::Online(1)]);

    let snap = h.adapter.get_target_state(1).unwrap();
    assert_eq!(snap.presence, PresenceState::Inactive);
    assert_eq!(snap.device, Some(DISK));
    assert!(!snap.gone);
    assert_eq!(h.sink.len(), 0);
}

#[test]
fn offline_flushes_queued_commands() {
    let h = Harness::new(config());
    h.adapter.submit(h.sink.command(3, 0)).unwrap();
    h.adapter.on_device_removed(3).unwrap();
    // Duplicate notifications do not restart the countdown.
    h.ticks(1);
    h.adapter.on_device_removed(3).unwrap();
    assert_eq!(
        h.adapter.submit(h.sink.command(3, 1)).unwrap(),
        Submission::Queued
    );

    h.ticks(2);
    assert_eq!(h.sink.tags(), vec![1]);
    assert_eq!(h.sink.reasons(), vec![CompletionReason::DeviceGone]);
    let snap = h.adapter.get_target_state(3).unwrap();
    assert_eq!(snap.presence, PresenceState::OfflineInProgress);
    assert_eq!(snap.in_flight, 1);

    assert_eq!(h.runner.run_pending(&h.adapter), 1);
    assert_eq!(h.presence.calls(), vec![PresenceCall::Offline(3)]);
    assert_eq!(
        h.adapter.get_target_state(3).unwrap().presence,
        PresenceState::Inactive
    );

    h.complete(
        h.transport.slot_of(&payload(0)).unwrap(),
        RawStatus::DeviceGone,
    );
    assert_eq!(
        h.sink.reasons(),
        vec![CompletionReason::DeviceGone, CompletionReason::DeviceGone]
    );

    // The device comes back.
    h.adapter.on_device_added(3, DISK).unwrap();
    h.runner.run_pending(&h.adapter);
    assert!(!h.adapter.get_target_state(3).unwrap().gone);
    assert_eq!(
        h.adapter.submit(h.sink.command(3, 2)).unwrap(),
        Submission::Accepted
    );
}

#[test]
fn failed_online_marks_the_target_gone() {
    let h = Harness::new(config());
    h.presence.online_succeeds.store(false, Ordering::SeqCst);
    h.adapter.on_device_added(0, DISK).unwrap();
    h.runner.run_pending(&h.adapter);

    let snap = h.adapter.get_target_state(0).unwrap();
    assert_eq!(snap.presence, PresenceState::Inactive);
    assert!(snap.gone);
    h.adapter.submit(h.sink.command(0, 0)).unwrap();
    assert_eq!(h.sink.reasons(), vec![CompletionReason::DeviceGone]);
    assert!(h.transport.submitted().is_empty());
}

#[test]
fn spawned_runner_settles_presence() {
    let Harness {
        adapter, runner, presence, ..
    } = Harness::new(config());
    let handle = runner.spawn(adapter.clone()).unwrap();
    adapter.on_device_added(2, DISK).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while adapter.get_target_state(2).unwrap().presence != PresenceState::Inactive {
        assert!(Instant::now() < deadline, "online work never finished");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(presence.calls(), vec![PresenceCall::Online(2)]);
    drop(handle);
}
