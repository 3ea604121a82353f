//! Command flow: selection, data phases, disconnects and error recovery

use super::*;
use crate::scsi::{MSG_ABORT, MSG_BUS_DEV_RESET, STATUS_CHECK_CONDITION};
use crate::sim::DisconnectAt;
use crate::sim::target::ScsiTarget;
use crate::spc::SpcState;
use crate::spc::error::ScsiError;

fn disconnecting(delay: Ticks) -> Quirks {
    Quirks {
        disconnect: DisconnectAt::AfterCommand,
        reselect_delay: delay,
        ..Default::default()
    }
}

#[test]
fn test_unit_ready() {
    let mut h = harness(&[(0, Quirks::default())]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.resid, 0);
    assert_eq!(h.spc.state(), SpcState::Idle);
    assert_eq!(h.spc.free_acbs(), h.spc.config().acb_count);
    assert_eq!(h.spc.target_info(0).cmds, 1);
    assert_eq!(h.sim().msgout_to(0), vec![vec![0xC0]]);
}

#[test]
fn read_blocks() {
    let mut h = harness(&[(3, Quirks::default())]);
    let c = h.run(ScsiRequest::new(3, 0, &read10(3, 2)).with_data(vec![0; 1024]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.resid, 0);
    assert_eq!(c.data[..512], disk_block(3));
    assert_eq!(c.data[512..], disk_block(4));
}

#[test]
fn write_block() {
    let mut h = harness(&[(1, Quirks::default())]);
    let c = h.run(ScsiRequest::new(1, 0, &write6(5, 1)).with_data(vec![0x5A; 512]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.resid, 0);

    let dev = &h.sim().target(1).unwrap().dev;
    assert_eq!(dev.read_blocks(5, 1), [0x5A; 512]);
    assert_eq!(dev.read_blocks(6, 1), disk_block(6));
}

#[test]
fn check_condition_and_sense() {
    let mut h = harness(&[(0, Quirks::default())]);
    let c = h.run(ScsiRequest::new(0, 0, &read10(1000, 1)).with_data(vec![0; 512]));
    assert_eq!(c.result, Ok(STATUS_CHECK_CONDITION));

    let c = h.run(ScsiRequest::new(0, 0, &[0x03, 0, 0, 0, 14, 0]).with_data(vec![0; 14]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.data[2], 0x05);
    assert_eq!(c.data[12..14], [0x21, 0x00]);
}

#[test]
fn disconnect_and_reselect() {
    let mut h = harness(&[(0, disconnecting(20)), (1, Quirks::default())]);
    let a = h
        .spc
        .submit(ScsiRequest::new(0, 0, &read10(7, 1)).with_data(vec![0; 512]))
        .unwrap();
    let b = h.spc.submit(ScsiRequest::new(1, 0, &TUR)).unwrap();

    // The other target runs while the first one is disconnected
    h.run_for(5);
    assert_eq!(h.sim().parked(), 1);
    let cb = h.take(b).unwrap();
    assert_eq!(cb.result, Ok(0));
    assert!(h.take(a).is_none());
    assert!(h.spc.target_info(0).lun_busy(0));

    let ca = h.run_until(a, 100);
    assert_eq!(ca.result, Ok(0));
    assert_eq!(ca.data, disk_block(7));
    assert_eq!(h.spc.target_info(0).disconnects, 1);
    assert!(!h.spc.target_info(0).lun_busy(0));
    assert_eq!(h.sim().parked(), 0);
}

#[test]
fn disconnect_in_data_phase() {
    let quirks = Quirks {
        disconnect: DisconnectAt::MidData(512),
        reselect_delay: 3,
        ..Default::default()
    };
    let mut h = harness(&[(2, quirks)]);
    let c = h.run(ScsiRequest::new(2, 0, &read10(10, 3)).with_data(vec![0; 1536]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.resid, 0);
    let expected: Vec<u8> = (10..13).flat_map(disk_block).collect();
    assert_eq!(c.data, expected);
    assert_eq!(h.spc.target_info(2).disconnects, 1);
}

#[test]
fn no_disconnect_privilege() {
    let config = SpcConfig {
        allow_disconnect: false,
        ..Default::default()
    };
    let mut h = Harness::new(config, &[(0, disconnecting(20))]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.spc.target_info(0).disconnects, 0);
    assert_eq!(h.sim().msgout_to(0), vec![vec![0x80]]);
}

#[test]
fn luns_of_one_target() {
    let mut h = harness(&[(0, disconnecting(10))]);
    let first = h.spc.submit(ScsiRequest::new(0, 0, &TUR)).unwrap();
    let second = h.spc.submit(ScsiRequest::new(0, 0, &TUR)).unwrap();
    let other = h.spc.submit(ScsiRequest::new(0, 1, &TUR)).unwrap();

    h.run_for(3);
    // Same lun waits, the other lun runs concurrently
    assert_eq!(h.sim().parked(), 2);
    assert!(h.spc.target_info(0).lun_busy(0));
    assert!(h.spc.target_info(0).lun_busy(1));

    assert_eq!(h.run_until(first, 100).result, Ok(0));
    assert_eq!(h.run_until(other, 100).result, Ok(0));
    assert_eq!(h.run_until(second, 100).result, Ok(0));
    assert_eq!(h.spc.target_info(0).cmds, 3);
}

#[test]
fn selection_timeout() {
    let mut h = harness(&[(0, Quirks::default())]);
    let start = h.sim().time_ms();
    let req = h.spc.submit(ScsiRequest::new(5, 0, &TUR)).unwrap();
    let c = h.run_until(req, 1000);
    let elapsed = h.sim().time_ms() - start;

    assert_eq!(c.result, Err(ScsiError::SelectionTimeout));
    assert!((249..=252).contains(&elapsed), "took {} ms", elapsed);
    assert_eq!(h.spc.state(), SpcState::Idle);
    assert!(!h.spc.target_info(5).lun_busy(0));
}

#[test]
fn selection_timeout_does_not_block_queue() {
    let mut h = harness(&[(0, Quirks::default())]);
    let missing = h.spc.submit(ScsiRequest::new(4, 0, &TUR)).unwrap();
    let present = h.spc.submit(ScsiRequest::new(0, 0, &TUR)).unwrap();
    assert_eq!(
        h.run_until(missing, 1000).result,
        Err(ScsiError::SelectionTimeout)
    );
    assert_eq!(h.run_until(present, 100).result, Ok(0));
}

#[test]
fn unexpected_bus_free() {
    let quirks = Quirks {
        bus_free_after_command: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(STATUS_CHECK_CONDITION));
    assert_eq!(h.spc.state(), SpcState::Idle);
}

#[test]
fn command_timeout_aborts() {
    let quirks = Quirks {
        hang_after_command: true,
        complete_on_abort: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR).with_timeout(100));
    assert_eq!(c.result, Err(ScsiError::CommandTimeout));
    assert_eq!(h.spc.target_info(0).timeouts, 1);
    assert_eq!(h.sim().msgout_to(0).last(), Some(&vec![MSG_ABORT]));

    // Target behaves again
    h.sim().set_quirks(0, Quirks::default());
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
}

#[test]
fn abort_timeout_resets_controller() {
    let quirks = Quirks {
        hang_after_command: true,
        ignore_atn: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR).with_timeout(100));
    assert_eq!(c.result, Err(ScsiError::CommandTimeout));
    assert_eq!(h.spc.target_info(0).timeouts, 2);
    assert!(!h.sim().connected());
    assert_eq!(h.sim().msgout_to(0), vec![vec![0xC0]]);
    assert_eq!(h.spc.state(), SpcState::Idle);

    h.sim().set_quirks(0, Quirks::default());
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
}

#[test]
fn command_timeout_target_drops_bus() {
    let quirks = Quirks {
        hang_after_command: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR).with_timeout(50));
    assert_eq!(c.result, Err(ScsiError::CommandTimeout));
    assert!(!h.sim().connected());
    assert_eq!(h.spc.state(), SpcState::Idle);
}

#[test]
fn short_data_out() {
    let mut h = harness(&[(0, Quirks::default())]);
    let c = h.run(ScsiRequest::new(0, 0, &write6(2, 1)).with_data(vec![0xA5; 600]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.resid, 88);
    assert_eq!(h.sim().target(0).unwrap().dev.read_blocks(2, 1), [0xA5; 512]);
}

#[test]
fn short_data_in() {
    let mut h = harness(&[(0, Quirks::default())]);
    let c = h.run(ScsiRequest::new(0, 0, &INQUIRY).with_data(vec![0; 64]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.resid, 28);
    assert_eq!(&c.data[8..16], b"SPCSIM  ");
}

#[test]
fn extra_data_in_drained() {
    let mut h = harness(&[(0, Quirks::default())]);
    let c = h.run(ScsiRequest::new(0, 0, &INQUIRY).with_data(vec![0; 16]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.resid, 0);
    assert_eq!(&c.data[8..16], b"SPCSIM  ");

    // Bus is in a sane state afterwards
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
}

#[test]
fn reselection_beats_selection() {
    let mut h = harness(&[(0, disconnecting(50)), (1, Quirks::default())]);
    let a = h
        .spc
        .submit(ScsiRequest::new(0, 0, &read10(1, 1)).with_data(vec![0; 512]))
        .unwrap();
    h.run_for(2);
    assert_eq!(h.sim().parked(), 1);

    h.sim().set_resel_beats_select(true);
    let b = h.spc.submit(ScsiRequest::new(1, 0, &TUR)).unwrap();

    let ca = h.run_until(a, 100);
    assert_eq!(ca.result, Ok(0));
    assert_eq!(ca.data, disk_block(1));
    let cb = h.run_until(b, 100);
    assert_eq!(cb.result, Ok(0));
    assert_eq!(h.spc.target_info(1).cmds, 1);
}

#[test]
fn cancel_disconnected() {
    let mut h = harness(&[(0, disconnecting(1000))]);
    let a = h
        .spc
        .submit(ScsiRequest::new(0, 0, &read10(0, 1)).with_data(vec![0; 512]))
        .unwrap();
    h.run_for(5);
    assert_eq!(h.sim().parked(), 1);

    assert!(h.spc.cancel(a));
    let c = h.run_until(a, 100);
    assert_eq!(c.result, Err(ScsiError::Aborted));
    assert_eq!(c.resid, 512);
    assert_eq!(h.sim().parked(), 0);
    assert_eq!(h.sim().msgout_to(0).last(), Some(&vec![0xC0, MSG_ABORT]));
    assert!(!h.spc.cancel(a));
}

#[test]
fn bus_reset_fails_everything() {
    let mut h = harness(&[(0, disconnecting(1000)), (1, disconnecting(1000))]);
    let handles = [
        h.spc.submit(ScsiRequest::new(0, 0, &TUR)).unwrap(),
        h.spc.submit(ScsiRequest::new(1, 0, &TUR)).unwrap(),
        h.spc.submit(ScsiRequest::new(0, 1, &TUR)).unwrap(),
        // Waits behind the first
        h.spc.submit(ScsiRequest::new(0, 0, &TUR)).unwrap(),
    ];
    h.run_for(5);
    assert_eq!(h.sim().parked(), 3);

    h.sim().assert_bus_reset();
    h.service();
    for handle in handles {
        let c = h.take(handle).unwrap();
        assert_eq!(c.result, Err(ScsiError::ControllerReset));
    }
    assert_eq!(h.spc.free_acbs(), h.spc.config().acb_count);
    assert_eq!(h.spc.state(), SpcState::Idle);
    for t in 0..2 {
        assert_eq!(h.spc.target_info(t).lubusy, 0);
    }

    let c = h.run(ScsiRequest::new(1, 0, &TUR));
    assert_eq!(c.result, Ok(0));
}

#[test]
fn polled_commands() {
    let mut h = harness(&[(0, Quirks::default()), (1, disconnecting(5))]);
    let c = h.spc.submit_poll(ScsiRequest::new(0, 0, &TUR)).unwrap();
    assert_eq!(c.result, Ok(0));

    let c = h
        .spc
        .submit_poll(ScsiRequest::new(1, 0, &read10(9, 1)).with_data(vec![0; 512]))
        .unwrap();
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.data, disk_block(9));
    // Nothing went to the channel
    assert!(h.rx.try_recv().is_err());
}

#[test]
fn polled_selection_timeout() {
    let mut h = harness(&[]);
    let c = h.spc.submit_poll(ScsiRequest::new(3, 0, &TUR)).unwrap();
    assert_eq!(c.result, Err(ScsiError::SelectionTimeout));
}

#[test]
fn device_reset() {
    let mut h = harness(&[(4, Quirks::default())]);
    let c = h.run(ScsiRequest::device_reset(4));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.sim().msgout_to(4), vec![vec![MSG_BUS_DEV_RESET]]);

    let c = h.run(ScsiRequest::new(4, 0, &TUR));
    assert_eq!(c.result, Ok(0));
}

#[test]
fn device_reset_ignored() {
    let quirks = Quirks {
        ignore_dev_reset: true,
        bus_free_after_msgout: true,
        ..Default::default()
    };
    let mut h = harness(&[(4, quirks)]);
    let c = h.run(ScsiRequest::device_reset(4));
    assert_eq!(c.result, Err(ScsiError::UnexpectedDisconnect));
    assert_eq!(h.sim().msgout_to(4), vec![vec![MSG_BUS_DEV_RESET, 0xC0]]);
    assert_eq!(h.spc.state(), SpcState::Idle);
}

#[test]
fn unknown_status_byte() {
    let quirks = Quirks {
        status: Some(0x18),
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(
        c.result,
        Err(ScsiError::ProtocolViolation("unexpected status byte"))
    );
    assert_eq!(h.spc.free_acbs(), h.spc.config().acb_count);
}

#[test]
fn full_pool_frees_on_completion() {
    let config = SpcConfig {
        acb_count: 2,
        ..Default::default()
    };
    let mut h = Harness::new(config, &[(0, Quirks::default()), (1, Quirks::default())]);
    let a = h.spc.submit(ScsiRequest::new(0, 0, &TUR)).unwrap();
    let b = h.spc.submit(ScsiRequest::new(1, 0, &TUR)).unwrap();
    assert_eq!(
        h.spc.submit(ScsiRequest::new(0, 0, &TUR)),
        Err(ScsiError::ResourceExhausted)
    );

    assert_eq!(h.run_until(a, 1000).result, Ok(0));
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.run_until(b, 1000).result, Ok(0));
    assert_eq!(h.spc.free_acbs(), 2);
}
