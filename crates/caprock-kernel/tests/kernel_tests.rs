//! End-to-end scenarios driven through `System` with the recording
//! test platform: boot, retype, server loops, revocation storms,
//! fault handling and interrupt routing.

use caprock_core::{ExecState, SchedEffect};
use caprock_hal::{SchedEvent, TestPlatform};
use caprock_kernel::{
    check_invariants, BootConfig, CapRights, FaultCause, Invocation, KernelError, Message,
    ObjectKind, Outcome, SlotRef, System, ThreadId, BOOT_SLOT_TCB, BOOT_SLOT_UNTYPED,
};

fn boot_system() -> System<TestPlatform> {
    System::new(TestPlatform::new(), &BootConfig::default()).unwrap()
}

fn slot(sys: &System<TestPlatform>, index: u32) -> SlotRef {
    SlotRef::new(sys.boot_info().root_cnode, index)
}

fn root(sys: &System<TestPlatform>) -> ThreadId {
    sys.boot_info().root_thread
}

fn untyped(sys: &System<TestPlatform>) -> SlotRef {
    sys.boot_info().untyped_slots[0]
}

/// Retype one object of `kind` into `dest`, panicking on failure.
fn retype_one(sys: &mut System<TestPlatform>, kind: ObjectKind, size_bits: u8, dest: u32) {
    let tid = root(sys);
    let src = untyped(sys);
    sys.invoke(
        tid,
        Invocation::Retype {
            untyped: src,
            kind,
            size_bits,
            dest: vec![slot(sys, dest)],
        },
    )
    .unwrap();
}

/// Create a second running thread out of the boot Untyped: retypes a
/// TCB into `tcb_slot`, configures it against the root CNode, and
/// resumes it.
fn spawn_thread(sys: &mut System<TestPlatform>, tcb_slot: u32) -> ThreadId {
    let tid = root(sys);
    retype_one(sys, ObjectKind::Tcb, 0, tcb_slot);
    sys.invoke(
        tid,
        Invocation::Configure {
            tcb: slot(sys, tcb_slot),
            cspace: slot(sys, 0),
            vspace: 0,
            ipc_buffer: 0,
        },
    )
    .unwrap();
    sys.invoke(tid, Invocation::Resume { tcb: slot(sys, tcb_slot) })
        .unwrap();
    let cap = sys.state().lookup_cap(slot(sys, tcb_slot)).unwrap();
    ThreadId::from_obj(cap.object)
}

// ============================================================================
// Boot and lifecycle
// ============================================================================

#[test]
fn test_boot_wakes_root_thread() {
    let sys = boot_system();

    let events = sys.platform().events();
    assert!(events.contains(&SchedEvent::Priority(root(&sys).0 as u64, 255)));
    assert!(events.contains(&SchedEvent::Woken(root(&sys).0 as u64)));
    check_invariants(sys.state()).unwrap();
}

#[test]
fn test_spawned_thread_can_invoke() {
    let mut sys = boot_system();
    let child = spawn_thread(&mut sys, 10);
    retype_one(&mut sys, ObjectKind::Notification, 0, 11);

    // The child runs against the shared CSpace like any other thread.
    let outcome = sys
        .invoke(child, Invocation::Poll { ntfn: slot(&sys, 11) })
        .unwrap();
    assert_eq!(outcome, Outcome::NoMessage);
    check_invariants(sys.state()).unwrap();
}

#[test]
fn test_prepare_thread_writes_loader_frame() {
    let mut sys = boot_system();
    let child = spawn_thread(&mut sys, 10);
    let tid = root(&sys);

    sys.prepare_thread(tid, slot(&sys, 10), 0x4000, 0xF000)
        .unwrap();

    let regs = sys.state().thread(child).unwrap().registers;
    assert_eq!(regs.pc, 0x4000);
    assert_eq!(regs.sp, 0xF000);
}

#[test]
fn test_uptime_follows_platform_clock() {
    let sys = boot_system();
    assert_eq!(sys.uptime_nanos(), 0);
    sys.platform().advance(1_500);
    assert_eq!(sys.uptime_nanos(), 1_500);
}

// ============================================================================
// Badged server loop
// ============================================================================

#[test]
fn test_server_distinguishes_clients_by_badge() {
    let mut sys = boot_system();
    let server = spawn_thread(&mut sys, 10);
    let client_a = spawn_thread(&mut sys, 11);
    let client_b = spawn_thread(&mut sys, 12);
    let tid = root(&sys);
    retype_one(&mut sys, ObjectKind::Endpoint, 0, 20);
    for (dest, badge) in [(21u32, 0xA), (22u32, 0xB)] {
        sys.invoke(
            tid,
            Invocation::Mint {
                src: slot(&sys, 20),
                dest: slot(&sys, dest),
                rights: CapRights::ALL,
                badge,
            },
        )
        .unwrap();
    }

    // Both clients call through their own badged capability.
    assert_eq!(
        sys.invoke(
            client_a,
            Invocation::Call {
                ep: slot(&sys, 21),
                msg: Message::with_words(1, vec![10]),
            },
        )
        .unwrap(),
        Outcome::Blocked
    );
    assert_eq!(
        sys.invoke(
            client_b,
            Invocation::Call {
                ep: slot(&sys, 22),
                msg: Message::with_words(1, vec![20]),
            },
        )
        .unwrap(),
        Outcome::Blocked
    );

    // The server sees A first (FIFO) and its badge, not its claims.
    match sys
        .invoke(
            server,
            Invocation::Recv {
                ep: slot(&sys, 20),
                recv_slots: vec![],
            },
        )
        .unwrap()
    {
        Outcome::Delivered(d) => {
            assert_eq!(d.badge, 0xA);
            assert_eq!(d.msg.words, vec![10]);
        }
        other => panic!("expected delivery, got {:?}", other),
    }

    // ReplyRecv answers A and picks up B in one step.
    match sys
        .invoke(
            server,
            Invocation::ReplyRecv {
                ep: slot(&sys, 20),
                msg: Message::with_words(0, vec![11]),
                recv_slots: vec![],
            },
        )
        .unwrap()
    {
        Outcome::Delivered(d) => assert_eq!(d.badge, 0xB),
        other => panic!("expected delivery, got {:?}", other),
    }

    // A resumed with the server's answer.
    match sys.take_resumption(client_a) {
        Some(Ok(d)) => assert_eq!(d.msg.words, vec![11]),
        other => panic!("expected reply for A, got {:?}", other),
    }
    assert_eq!(
        sys.state().thread(client_b).unwrap().exec,
        ExecState::ReplyBlocked
    );
    check_invariants(sys.state()).unwrap();
}

#[test]
fn test_platform_sees_block_and_wake_sequence() {
    let mut sys = boot_system();
    let server = spawn_thread(&mut sys, 10);
    let tid = root(&sys);
    retype_one(&mut sys, ObjectKind::Endpoint, 0, 20);
    sys.platform().clear_events();

    sys.invoke(
        server,
        Invocation::Recv {
            ep: slot(&sys, 20),
            recv_slots: vec![],
        },
    )
    .unwrap();
    sys.invoke(
        tid,
        Invocation::Send {
            ep: slot(&sys, 20),
            msg: Message::new(1),
        },
    )
    .unwrap();

    let events = sys.platform().events();
    assert_eq!(events[0], SchedEvent::Blocked(server.0 as u64, caprock_hal::BlockReason::RecvWait));
    assert_eq!(events[1], SchedEvent::Woken(server.0 as u64));
}

// ============================================================================
// Capability transfer and revocation
// ============================================================================

#[test]
fn test_transferred_cap_dies_with_revocation() {
    let mut sys = boot_system();
    let receiver = spawn_thread(&mut sys, 10);
    let tid = root(&sys);
    retype_one(&mut sys, ObjectKind::Endpoint, 0, 20);
    retype_one(&mut sys, ObjectKind::Notification, 0, 21);

    // Receiver waits with a receive slot; root sends the notification
    // capability across.
    sys.invoke(
        receiver,
        Invocation::Recv {
            ep: slot(&sys, 20),
            recv_slots: vec![slot(&sys, 30)],
        },
    )
    .unwrap();
    let mut msg = Message::new(1);
    msg.cap_slots = vec![slot(&sys, 21)];
    sys.invoke(tid, Invocation::Send { ep: slot(&sys, 20), msg })
        .unwrap();

    match sys.take_resumption(receiver) {
        Some(Ok(d)) => assert_eq!(d.transferred, 1),
        other => panic!("expected transfer, got {:?}", other),
    }
    assert!(sys.state().lookup_cap(slot(&sys, 30)).is_ok());

    // Revoking at the source reaches the transferred copy.
    sys.invoke(tid, Invocation::Revoke { slot: slot(&sys, 21) })
        .unwrap();
    assert!(sys.state().slot_is_empty(slot(&sys, 30)).unwrap());
    check_invariants(sys.state()).unwrap();
}

#[test]
fn test_revoke_storm_reclaims_untyped() {
    let mut sys = boot_system();
    let tid = root(&sys);
    // Carve a child Untyped and build a small object zoo inside it.
    retype_one(&mut sys, ObjectKind::Untyped, 14, 20);
    for (kind, dest) in [
        (ObjectKind::Endpoint, 21u32),
        (ObjectKind::Notification, 22),
        (ObjectKind::Tcb, 23),
        (ObjectKind::CNode, 24),
    ] {
        let size_bits = if kind == ObjectKind::CNode { 4 } else { 0 };
        sys.invoke(
            tid,
            Invocation::Retype {
                untyped: slot(&sys, 20),
                kind,
                size_bits,
                dest: vec![slot(&sys, dest)],
            },
        )
        .unwrap();
    }

    // One revoke at the child Untyped deletes the whole zoo and
    // resets its watermark; the region is immediately reusable.
    sys.invoke(tid, Invocation::Revoke { slot: slot(&sys, 20) })
        .unwrap();
    for i in 21..=24 {
        assert!(sys.state().slot_is_empty(slot(&sys, i)).unwrap());
    }
    sys.invoke(
        tid,
        Invocation::Retype {
            untyped: slot(&sys, 20),
            kind: ObjectKind::Endpoint,
            size_bits: 0,
            dest: vec![slot(&sys, 25)],
        },
    )
    .unwrap();
    check_invariants(sys.state()).unwrap();
}

#[test]
fn test_destroying_tcb_kills_thread() {
    let mut sys = boot_system();
    let victim = spawn_thread(&mut sys, 10);
    let tid = root(&sys);
    sys.platform().clear_events();

    sys.invoke(tid, Invocation::Delete { slot: slot(&sys, 10) })
        .unwrap();

    assert!(sys
        .platform()
        .events()
        .contains(&SchedEvent::Exited(victim.0 as u64)));
    assert!(sys.state().thread(victim).is_err());
    check_invariants(sys.state()).unwrap();
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn test_fault_handled_and_resumed() {
    let mut sys = boot_system();
    let faulter = spawn_thread(&mut sys, 10);
    let handler = spawn_thread(&mut sys, 11);
    let tid = root(&sys);
    retype_one(&mut sys, ObjectKind::Endpoint, 0, 20);
    sys.invoke(
        tid,
        Invocation::Mint {
            src: slot(&sys, 20),
            dest: slot(&sys, 21),
            rights: CapRights::ALL,
            badge: 0xFA,
        },
    )
    .unwrap();
    sys.invoke(
        tid,
        Invocation::SetFaultHandler {
            tcb: slot(&sys, 10),
            handler: Some(slot(&sys, 21)),
        },
    )
    .unwrap();
    sys.invoke(
        handler,
        Invocation::Recv {
            ep: slot(&sys, 20),
            recv_slots: vec![],
        },
    )
    .unwrap();

    sys.raise_fault(
        faulter,
        FaultCause::VmFault {
            addr: 0x7000,
            write: true,
        },
    )
    .unwrap();

    match sys.take_resumption(handler) {
        Some(Ok(d)) => assert_eq!(d.badge, 0xFA),
        other => panic!("expected fault message, got {:?}", other),
    }
    sys.invoke(
        handler,
        Invocation::Reply {
            msg: Message::with_words(0, vec![0x9000]),
        },
    )
    .unwrap();
    assert_eq!(sys.state().thread(faulter).unwrap().exec, ExecState::Running);
    assert_eq!(sys.state().thread(faulter).unwrap().registers.pc, 0x9000);
    check_invariants(sys.state()).unwrap();
}

#[test]
fn test_unhandled_fault_is_fatal() {
    let mut sys = boot_system();
    let faulter = spawn_thread(&mut sys, 10);
    sys.platform().clear_events();

    let outcome = sys
        .raise_fault(faulter, FaultCause::DebugTrap)
        .unwrap();

    assert_eq!(outcome, Outcome::ThreadTerminated);
    assert!(sys
        .platform()
        .events()
        .contains(&SchedEvent::Exited(faulter.0 as u64)));
    assert_eq!(sys.platform().debug_log(), vec!["thread killed".to_string()]);
}

// ============================================================================
// Interrupts
// ============================================================================

#[test]
fn test_irq_routes_to_notification() {
    let mut sys = boot_system();
    let tid = root(&sys);
    retype_one(&mut sys, ObjectKind::Notification, 0, 20);
    sys.invoke(
        tid,
        Invocation::Mint {
            src: slot(&sys, 20),
            dest: slot(&sys, 21),
            rights: CapRights::ALL,
            badge: 1 << 3,
        },
    )
    .unwrap();

    sys.bind_irq(9, slot(&sys, 21)).unwrap();
    sys.handle_irq(9).unwrap();
    sys.handle_irq(9).unwrap(); // coalesces

    assert_eq!(
        sys.invoke(tid, Invocation::Wait { ntfn: slot(&sys, 20) }).unwrap(),
        Outcome::Badge(1 << 3)
    );
    // An unbound line fails and leaves a trace on the debug channel.
    assert_eq!(sys.handle_irq(7).unwrap_err(), KernelError::FailedLookup);
    assert_eq!(sys.platform().debug_log(), vec!["unbound irq".to_string()]);
}

#[test]
fn test_irq_binding_requires_notification_cap() {
    let mut sys = boot_system();
    retype_one(&mut sys, ObjectKind::Endpoint, 0, 20);

    assert_eq!(
        sys.bind_irq(3, slot(&sys, 20)).unwrap_err(),
        KernelError::InvalidCapability
    );
}

#[test]
fn test_revoked_binding_stops_delivering() {
    let mut sys = boot_system();
    let tid = root(&sys);
    retype_one(&mut sys, ObjectKind::Notification, 0, 20);
    sys.invoke(
        tid,
        Invocation::Mint {
            src: slot(&sys, 20),
            dest: slot(&sys, 21),
            rights: CapRights::ALL,
            badge: 1,
        },
    )
    .unwrap();
    sys.bind_irq(4, slot(&sys, 21)).unwrap();

    sys.invoke(tid, Invocation::Revoke { slot: slot(&sys, 20) })
        .unwrap();

    // The stale binding resolves to an empty slot and fails cleanly.
    assert_eq!(sys.handle_irq(4).unwrap_err(), KernelError::FailedLookup);
}

// ============================================================================
// Effects surface
// ============================================================================

#[test]
fn test_set_priority_reaches_platform() {
    let mut sys = boot_system();
    let child = spawn_thread(&mut sys, 10);
    let tid = root(&sys);
    sys.platform().clear_events();

    sys.invoke(
        tid,
        Invocation::SetPriority {
            tcb: slot(&sys, 10),
            priority: 42,
        },
    )
    .unwrap();

    assert_eq!(
        sys.platform().events(),
        vec![SchedEvent::Priority(child.0 as u64, 42)]
    );
}

#[test]
fn test_suspend_and_resume_roundtrip() {
    let mut sys = boot_system();
    let child = spawn_thread(&mut sys, 10);
    let tid = root(&sys);

    sys.invoke(tid, Invocation::Suspend { tcb: slot(&sys, 10) })
        .unwrap();
    assert_eq!(sys.state().thread(child).unwrap().exec, ExecState::Inactive);
    // A suspended thread cannot invoke.
    assert_eq!(
        sys.invoke(child, Invocation::Suspend { tcb: slot(&sys, BOOT_SLOT_TCB) })
            .unwrap_err(),
        KernelError::InvalidArgument
    );

    sys.invoke(tid, Invocation::Resume { tcb: slot(&sys, 10) })
        .unwrap();
    assert_eq!(sys.state().thread(child).unwrap().exec, ExecState::Running);
}

#[test]
fn test_boot_untyped_slot_constant_matches_info() {
    let sys = boot_system();
    assert_eq!(
        sys.boot_info().untyped_slots[0],
        slot(&sys, BOOT_SLOT_UNTYPED)
    );
    // Effects enum is part of the public contract; make sure the kill
    // variant stays comparable for embedders.
    let _ = SchedEffect::Killed { tid: root(&sys) };
}
