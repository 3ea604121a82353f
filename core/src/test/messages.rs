//! Message phases: negotiation, parity recovery and rejects

use super::*;
use crate::bus::SpcBus;
use crate::spc::error::ScsiError;
use crate::spc::regs::SpcReg;
use crate::scsi::{
    MSG_ABORT, MSG_BUS_DEV_RESET, MSG_INITIATOR_DET_ERR, MSG_MESSAGE_REJECT, MSG_PARITY_ERROR,
};

const SDTR_25_8: [u8; 5] = [0x01, 0x03, 0x01, 25, 8];
const SDTR_ASYNC: [u8; 5] = [0x01, 0x03, 0x01, 0, 0];

#[test]
fn target_offer_refused_when_async() {
    let quirks = Quirks {
        sdtr_offer: Some((25, 9)),
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.sim().msgout_to(0), vec![vec![0xC0], SDTR_ASYNC.to_vec()]);
    assert_eq!(h.sim().agreed_sync(0), Some((0, 0)));
    let ti = h.spc.target_info(0);
    assert_eq!(ti.offset, 0);
    assert!(!ti.sync_pending);
}

#[test]
fn oversized_offset_answered_async() {
    let quirks = Quirks {
        sdtr_offer: Some((25, 9)),
        ..Default::default()
    };
    let mut h = Harness::new(sync_config(), &[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));

    let mut first = vec![0xC0];
    first.extend(SDTR_25_8);
    assert_eq!(h.sim().msgout_to(0), vec![first, SDTR_ASYNC.to_vec()]);
    assert_eq!(h.sim().agreed_sync(0), Some((0, 0)));
    let ti = h.spc.target_info(0);
    assert_eq!(ti.offset, 0);
    assert!(!ti.sync_pending);
    assert_eq!(h.sim().read(SpcReg::TMOD), 0);
}

#[test]
fn sync_negotiation() {
    let mut h = Harness::new(sync_config(), &[(0, Quirks::default())]);
    let c = h.run(ScsiRequest::new(0, 0, &read10(2, 1)).with_data(vec![0; 512]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(c.data, disk_block(2));

    let mut first = vec![0xC0];
    first.extend(SDTR_25_8);
    assert_eq!(h.sim().msgout_to(0), vec![first]);
    assert_eq!(h.sim().agreed_sync(0), Some((25, 8)));
    let ti = h.spc.target_info(0);
    assert_eq!((ti.period, ti.offset), (25, 8));
    assert!(!ti.sync_pending);
}

#[test]
fn negotiation_happens_once() {
    let mut h = Harness::new(sync_config(), &[(0, Quirks::default())]);
    for _ in 0..2 {
        assert_eq!(h.run(ScsiRequest::new(0, 0, &TUR)).result, Ok(0));
    }
    let log = h.sim().msgout_to(0);
    assert_eq!(log.len(), 2);
    assert!(log[0].ends_with(&SDTR_25_8));
    assert_eq!(log[1], vec![0xC0]);

    h.spc.renegotiate(0);
    assert!(h.spc.target_info(0).sync_pending);
    assert_eq!(h.run(ScsiRequest::new(0, 0, &TUR)).result, Ok(0));
    let log = h.sim().msgout_to(0);
    assert_eq!(log[2], log[0]);
    assert_eq!(h.spc.target_info(0).offset, 8);
}

#[test]
fn target_offer_accepted() {
    let quirks = Quirks {
        sdtr_offer: Some((50, 4)),
        ..Default::default()
    };
    let mut h = Harness::new(sync_config(), &[(1, quirks)]);
    let c = h.run(ScsiRequest::new(1, 0, &TUR));
    assert_eq!(c.result, Ok(0));

    // Our SDTR went out and the target countered
    let ti = h.spc.target_info(1);
    assert_eq!((ti.period, ti.offset), (50, 4));
    assert_eq!(h.sim().msgout_to(1).len(), 1);
}

#[test]
fn unusable_offer_goes_async() {
    let quirks = Quirks {
        sdtr_offer: Some((10, 8)),
        ..Default::default()
    };
    let mut h = Harness::new(sync_config(), &[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.sim().msgout_to(0).last(), Some(&SDTR_ASYNC.to_vec()));
    assert_eq!(h.spc.target_info(0).offset, 0);
}

#[test]
fn sdtr_rejected() {
    let quirks = Quirks {
        reject_sdtr: true,
        ..Default::default()
    };
    let mut h = Harness::new(sync_config(), &[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    let ti = h.spc.target_info(0);
    assert_eq!(ti.offset, 0);
    assert!(!ti.sync_pending);

    // Not tried again
    assert_eq!(h.run(ScsiRequest::new(0, 0, &TUR)).result, Ok(0));
    assert_eq!(h.sim().msgout_to(0).last(), Some(&vec![0xC0]));
}

#[test]
fn wide_negotiation() {
    let config = SpcConfig {
        use_wide: true,
        max_width: 1,
        ..Default::default()
    };
    let mut h = Harness::new(config, &[(0, Quirks::default())]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.sim().msgout_to(0), vec![vec![0xC0, 0x01, 0x02, 0x03, 1]]);
    let ti = h.spc.target_info(0);
    assert_eq!(ti.width, 0);
    assert!(!ti.wide_pending);
}

#[test]
fn sdtr_resent_after_parity_error() {
    let quirks = Quirks {
        parity_error_on_msgout: true,
        ..Default::default()
    };
    let mut h = Harness::new(sync_config(), &[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));

    let log = h.sim().msgout_to(0);
    assert_eq!(log.len(), 2);
    assert!(log[0].ends_with(&SDTR_25_8));
    assert_eq!(log[1], SDTR_25_8);
    assert_eq!(h.spc.target_info(0).offset, 8);
}

#[test]
fn message_out_retransmitted() {
    let quirks = Quirks {
        retransmit_msgout_once: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.sim().msgout_to(0), vec![vec![0xC0], vec![0xC0]]);
}

#[test]
fn message_in_parity_error() {
    let quirks = Quirks {
        msgin_parity_once: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.sim().msgout_to(0).last(), Some(&vec![MSG_PARITY_ERROR]));
}

#[test]
fn data_parity_error_reported() {
    let quirks = Quirks {
        data_parity_once: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &read10(0, 1)).with_data(vec![0; 512]));
    assert_eq!(c.result, Ok(0));
    assert_eq!(
        h.sim().msgout_to(0).last(),
        Some(&vec![MSG_INITIATOR_DET_ERR])
    );
}

#[test]
fn rejected_parity_report_fails_command() {
    let quirks = Quirks {
        data_parity_once: true,
        reject_msg: Some(MSG_INITIATOR_DET_ERR),
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &read10(0, 1)).with_data(vec![0; 512]));
    assert_eq!(c.result, Err(ScsiError::BusParityError));
    assert_eq!(h.sim().msgout_to(0).last(), Some(&vec![MSG_ABORT]));
    assert!(!h.sim().connected());
}

#[test]
fn device_reset_rejected() {
    let quirks = Quirks {
        reject_msg: Some(MSG_BUS_DEV_RESET),
        bus_free_after_msgout: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::device_reset(0));
    assert_eq!(c.result, Err(ScsiError::MessageRejected));
    assert_eq!(
        h.sim().msgout_to(0),
        vec![vec![MSG_BUS_DEV_RESET], vec![0xC0]]
    );
}

#[test]
fn unknown_message_rejected() {
    let quirks = Quirks {
        unknown_msg: true,
        ..Default::default()
    };
    let mut h = harness(&[(0, quirks)]);
    let c = h.run(ScsiRequest::new(0, 0, &TUR));
    assert_eq!(c.result, Ok(0));
    assert_eq!(h.sim().msgout_to(0).last(), Some(&vec![MSG_MESSAGE_REJECT]));
}

#[test]
fn reselection_without_command_aborted() {
    let mut h = harness(&[(2, Quirks::default())]);
    h.sim().inject_reselect(2, 1).unwrap();
    h.run_for(1);

    assert_eq!(h.sim().msgout_to(2), vec![vec![MSG_ABORT]]);
    assert_eq!(h.sim().parked(), 0);
    assert!(!h.sim().connected());

    // Still usable
    assert_eq!(h.run(ScsiRequest::new(2, 1, &TUR)).result, Ok(0));
}
