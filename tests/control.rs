// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod common;

use scx_arinc653::abi;
use scx_arinc653::abi::SchedOpCmd;
use scx_arinc653::abi::ENTRY_LEN;
use scx_arinc653::abi::HEADER_LEN;
use scx_arinc653::abi::PAYLOAD_LEN;
use scx_arinc653::types::millisecs;
use scx_arinc653::*;

use common::*;

fn put(sched: &Arinc653Scheduler<SimHypervisor>, s: &Schedule) -> Result<usize, SchedError> {
    let mut buf = vec![0u8; abi::payload_len(s.entries.len())];
    abi::encode_schedule(s, &mut buf).unwrap();
    sched.adjust_global(SchedOpCmd::PUTINFO, &mut buf)
}

fn invalid(cause: InvalidCause) -> Result<usize, SchedError> {
    Err(SchedError::Invalid(cause))
}

#[test]
fn test_put_then_get_returns_schedule() {
    setup_test();
    let sched = boot(2, 0);
    let s = schedule(
        &[
            (handle(1), millisecs(2)),
            (DomainHandle::ZERO, millisecs(3)),
            (handle(2), millisecs(4)),
        ],
        millisecs(12),
    );
    assert_eq!(put(&sched, &s), Ok(0));

    let mut buf = vec![0xffu8; PAYLOAD_LEN];
    let len = sched
        .adjust_global(SchedOpCmd::GETINFO, &mut buf)
        .unwrap();
    assert_eq!(len, abi::payload_len(3));
    assert_eq!(abi::decode_schedule(&buf[..len]).unwrap(), s);
    assert_eq!(sched.get_schedule(), s);

    assert_eq!(&buf[4..8], &[0; 4]);
    for i in 0..3 {
        let off = HEADER_LEN + i * ENTRY_LEN;
        assert_eq!(&buf[off + 16..off + 24], &[0; 8], "entry {i}");
    }
}

#[test]
fn test_major_frame_fit_is_exact() {
    let sched = boot(1, 0);
    let h = handle(3);
    let fits = schedule(&[(h, millisecs(4)), (h, millisecs(6))], millisecs(10));
    assert_eq!(put(&sched, &fits), Ok(0));

    let over = schedule(&[(h, millisecs(4)), (h, millisecs(6) + 1)], millisecs(10));
    assert_eq!(
        put(&sched, &over),
        invalid(InvalidCause::Overcommitted {
            total: millisecs(10) + 1,
            major_frame: millisecs(10),
        })
    );
    assert_eq!(sched.get_schedule(), fits);
}

#[test]
fn test_entry_count_bounds() {
    let sched = boot(1, 0);

    let one = schedule(&[(handle(1), 1)], 1);
    assert_eq!(put(&sched, &one), Ok(0));

    let none = schedule(&[], millisecs(10));
    assert_eq!(put(&sched, &none), invalid(InvalidCause::NoEntries));

    let full: Vec<_> = (0..MAX_ENTRIES as u8).map(|i| (handle(i), 1_000)).collect();
    let max = schedule(&full, 64_000);
    assert_eq!(put(&sched, &max), Ok(0));

    // One past the limit, with a buffer large enough to hold it.
    let mut buf = vec![0u8; PAYLOAD_LEN + ENTRY_LEN];
    buf[0..4].copy_from_slice(&65u32.to_le_bytes());
    buf[8..16].copy_from_slice(&millisecs(10).to_le_bytes());
    let err = sched
        .adjust_global(SchedOpCmd::PUTINFO, &mut buf)
        .unwrap_err();
    assert_eq!(
        err,
        SchedError::Invalid(InvalidCause::TooManyEntries { count: 65, max: 64 })
    );
    assert_eq!(sched.get_schedule(), max);
}

#[test]
fn test_non_positive_times_rejected() {
    let sched = boot(1, 0);
    let h = handle(1);
    assert_eq!(
        put(&sched, &schedule(&[(h, 1)], 0)),
        invalid(InvalidCause::NonPositiveMajorFrame { major_frame: 0 })
    );
    assert_eq!(
        put(&sched, &schedule(&[(h, millisecs(1)), (h, -1)], millisecs(10))),
        invalid(InvalidCause::NonPositiveRuntime {
            index: 1,
            runtime: -1,
        })
    );
    assert_eq!(put(&sched, &schedule(&[(h, 0)], millisecs(10))).map_err(|e| e.errno()), Err(-22));
    assert_eq!(sched.stats().nr_rejects, 3);
}

#[test]
fn test_reserved_fields_must_be_zero() {
    let sched = boot(1, 0);
    let s = schedule(&[(handle(1), millisecs(5)), (handle(2), millisecs(5))], millisecs(10));
    let mut clean = vec![0u8; abi::payload_len(2)];
    abi::encode_schedule(&s, &mut clean).unwrap();

    let mut buf = clean.clone();
    buf[4] = 1;
    assert_eq!(
        sched.adjust_global(SchedOpCmd::PUTINFO, &mut buf),
        invalid(InvalidCause::ReservedFieldSet { index: None })
    );

    let mut buf = clean.clone();
    buf[HEADER_LEN + ENTRY_LEN + 20] = 1;
    assert_eq!(
        sched.adjust_global(SchedOpCmd::PUTINFO, &mut buf),
        invalid(InvalidCause::ReservedFieldSet { index: Some(1) })
    );

    let mut buf = clean;
    assert_eq!(sched.adjust_global(SchedOpCmd::PUTINFO, &mut buf), Ok(0));
    assert_eq!(sched.get_schedule(), s);
}

#[test]
fn test_short_buffers_fault() {
    let sched = boot(1, 0);
    let boot_schedule = sched.get_schedule();

    let mut tiny = vec![0u8; HEADER_LEN - 1];
    let err = sched
        .adjust_global(SchedOpCmd::PUTINFO, &mut tiny)
        .unwrap_err();
    assert_eq!(err.errno(), -14);

    // Header promises two entries, buffer carries one.
    let s = schedule(&[(handle(1), millisecs(5)), (handle(2), millisecs(5))], millisecs(10));
    let mut buf = vec![0u8; abi::payload_len(2)];
    abi::encode_schedule(&s, &mut buf).unwrap();
    buf.truncate(abi::payload_len(1));
    assert_eq!(
        sched.adjust_global(SchedOpCmd::PUTINFO, &mut buf),
        Err(SchedError::Fault)
    );

    let mut short = vec![0u8; HEADER_LEN];
    assert_eq!(
        sched.adjust_global(SchedOpCmd::GETINFO, &mut short),
        Err(SchedError::Fault)
    );
    assert_eq!(sched.get_schedule(), boot_schedule);
}

#[test]
fn test_unknown_command() {
    let sched = boot(1, 0);
    let mut buf = vec![0u8; PAYLOAD_LEN];
    let err = sched.adjust_global(7, &mut buf).unwrap_err();
    assert_eq!(err, SchedError::Invalid(InvalidCause::UnknownCommand { cmd: 7 }));
    assert_eq!(err.errno(), -22);
}

#[test]
fn test_install_moves_epoch_and_rebuilds_pool() {
    setup_test();
    let sched = boot(2, millisecs(1));
    let h = handle(9);
    let (_, units) = admit(&sched, h, &["0", "1"]);
    sched.hv().clock().set(millisecs(7));
    let s = schedule(&[(h, millisecs(3)), (handle(8), millisecs(3))], millisecs(8));
    assert_eq!(put(&sched, &s), Ok(0));
    assert_eq!(sched.epoch(), millisecs(7));

    for (cpu, unit) in units.iter().enumerate() {
        let cpu = cpu as u32;
        assert_eq!(
            frame_units(&sched, cpu),
            vec![UnitRef::Guest(*unit), UnitRef::Idle(CpuId(cpu))]
        );
        sched
            .with_pcpu(CpuId(cpu), |pc| {
                assert_eq!(pc.index(), 0);
                assert!(!pc.in_gap());
                assert_eq!(pc.next_switch_time(), millisecs(10));
            })
            .unwrap();
        assert!(sched.hv().softirq_pending(CpuId(cpu)));
    }
    assert_eq!(sched.stats().nr_installs, 1);
}
