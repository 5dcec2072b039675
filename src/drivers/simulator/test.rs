use crate::bus::{DaliBus, GearError};
use crate::common::address::Short;
use crate::drivers::command_utils::send16;
use crate::drivers::dispatcher::{self, FrameSender, SETTLE_TIME};
use crate::drivers::driver::{DaliBusEventType, DaliFrame, DaliSendResult};
use crate::drivers::send_flags::NO_FLAG;
use crate::drivers::simulator::bus::{sim_bus, SimHandle, WriteRecord};
use crate::drivers::simulator::gear::SimGear;
use crate::gear::cmd_defs as cmd;
use crate::utils::discover::{ScanControl, ScanError, ScanOptions};
use crate::utils::long_address;
use crate::utils::memory_banks::UniqueId;
use std::collections::HashSet;
use std::time::Duration;
use tokio_stream::StreamExt;

fn bus_with(gears: Vec<SimGear>) -> (DaliBus, SimHandle) {
    let (transport, sim) = sim_bus();
    for gear in gears {
        sim.add_gear(gear);
    }
    (DaliBus::new(Box::new(transport)), sim)
}

fn count_compares(writes: &[WriteRecord]) -> usize {
    writes
        .iter()
        .filter(|w| w.frame == DaliFrame::Frame16(cmd::COMPARE().0))
        .count()
}

#[tokio::test(start_paused = true)]
async fn scan_three_devices() {
    let (bus, sim) = bus_with(vec![
        SimGear::new(0x0000aa, 1).with_random(0x010203),
        SimGear::new(0x0000bb, 2).with_random(0x0f0f0f),
        SimGear::new(0x0000cc, 3).with_random(0xabcdef),
    ]);
    let report = bus.scan_for_gear(ScanOptions::default()).await.unwrap();

    assert_eq!(report.devices.len(), 3);
    assert!(report.failures.is_empty());
    // short addresses follow ascending random address
    let shorts: Vec<u8> = report
        .devices
        .iter()
        .map(|d| d.short_address.unwrap().value())
        .collect();
    assert_eq!(shorts, vec![0, 1, 2]);
    sim.with_gears(|gears| {
        for gear in gears.iter() {
            let expected = match gear.random_address {
                0x010203 => 0,
                0x0f0f0f => 1,
                0xabcdef => 2,
                other => panic!("unexpected random address 0x{:06x}", other),
            };
            assert_eq!(gear.short_address, expected);
        }
    });
    let ids: HashSet<UniqueId> = report.devices.iter().map(|d| d.unique_id).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(bus.devices().len(), 3);
    sim.with_gears(|gears| {
        for gear in gears.iter() {
            let (gtin, serial, index) = gear.unique_id_parts();
            assert!(ids.contains(&UniqueId {
                gtin,
                serial,
                index
            }));
        }
    });

    // bounded search: a full-range probe, at most 24 halvings and a
    // final check per device, one closing probe
    assert!(count_compares(&sim.writes()) <= 3 * 26 + 1);
}

#[tokio::test(start_paused = true)]
async fn scan_empty_bus_compares_once() {
    let (bus, sim) = bus_with(Vec::new());
    let report = bus.scan_for_gear(ScanOptions::default()).await.unwrap();
    assert!(report.devices.is_empty());
    assert_eq!(count_compares(&sim.writes()), 1);
}

#[tokio::test(start_paused = true)]
async fn unique_id_survives_readdressing() {
    let (bus, sim) = bus_with(vec![
        SimGear::new(0x0000aa, 1).with_random(0x000100),
        SimGear::new(0x0000bb, 2).with_random(0x000200),
    ]);
    let report = bus.scan_for_gear(ScanOptions::default()).await.unwrap();
    let by_id = |id: UniqueId| {
        bus.devices()
            .into_iter()
            .find(|d| d.unique_id == id)
            .unwrap()
    };
    let id_a = report.devices[0].unique_id;
    let id_b = report.devices[1].unique_id;
    assert_eq!(by_id(id_a).short_address.unwrap().value(), 0);
    assert_eq!(by_id(id_b).short_address.unwrap().value(), 1);

    // next RANDOMISE reverses the order, the full rescan hands out
    // fresh addresses
    sim.with_gears(|gears| {
        for gear in gears.iter_mut() {
            let next = match gear.random_address {
                0x000100 => 0x222222,
                _ => 0x111111,
            };
            gear.random_plan.push_back(next);
        }
    });
    let report = bus
        .scan_for_gear(ScanOptions { full: true })
        .await
        .unwrap();
    assert_eq!(report.devices.len(), 2);
    assert_eq!(bus.devices().len(), 2, "rescan must not duplicate devices");
    assert_eq!(by_id(id_a).short_address.unwrap().value(), 1);
    assert_eq!(by_id(id_b).short_address.unwrap().value(), 0);
}

#[tokio::test(start_paused = true)]
async fn writes_respect_settle_time() {
    let (bus, sim) = bus_with(vec![SimGear::new(0x0000aa, 1).with_random(0x004242)]);
    bus.scan_for_gear(ScanOptions::default()).await.unwrap();
    let writes = sim.writes();
    assert!(writes.len() > 70); // probe phase alone is 64 frames
    for pair in writes.windows(2) {
        let gap = pair[1].at - pair[0].at;
        assert!(
            gap >= SETTLE_TIME,
            "{:?} between consecutive writes",
            gap
        );
    }
}

#[tokio::test(start_paused = true)]
async fn send_twice_commands_write_twice() {
    let (transport, sim) = sim_bus();
    let (handle, _join) = dispatcher::start(Box::new(transport));
    send16::cmd(&handle, cmd::RANDOMISE())
        .await
        .check_send()
        .unwrap();
    let writes = sim.writes();
    assert_eq!(writes.len(), 2, "one logical call, two transmissions");
    assert_eq!(writes[0].frame, writes[1].frame);
    let gap = writes[1].at - writes[0].at;
    assert!(gap >= SETTLE_TIME && gap <= Duration::from_millis(100));
    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn single_commands_write_once() {
    let (transport, sim) = sim_bus();
    let (handle, _join) = dispatcher::start(Box::new(transport));
    send16::cmd(&handle, cmd::TERMINATE())
        .await
        .check_send()
        .unwrap();
    assert_eq!(sim.writes().len(), 1);
    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_device_is_not_addressed() {
    let (bus, sim) = bus_with(Vec::new());
    let gear = bus.gear(UniqueId {
        gtin: 0x0000aa,
        serial: 77,
        index: 0,
    });
    match gear.on().await {
        Err(GearError::DeviceNotAddressed) => {}
        r => panic!("expected DeviceNotAddressed, got {:?}", r.err()),
    }
    assert!(sim.writes().is_empty(), "no frame may reach the bus");
}

#[tokio::test(start_paused = true)]
async fn control_and_status_round_trip() {
    let (bus, sim) = bus_with(vec![SimGear::new(0x0000aa, 1).with_random(0x000300)]);
    let report = bus.scan_for_gear(ScanOptions::default()).await.unwrap();
    let gear = bus.gear(report.devices[0].unique_id);

    gear.on().await.unwrap();
    sim.with_gears(|gears| assert_eq!(gears[0].actual_level, 0xfe));
    assert!(gear.query_status().await.unwrap().lamp_on());

    gear.set_level(10).await.unwrap();
    assert_eq!(gear.query_actual_level().await.unwrap(), 10);

    gear.off().await.unwrap();
    sim.with_gears(|gears| assert_eq!(gears[0].actual_level, 0));
    assert!(!gear.query_status().await.unwrap().lamp_on());
}

#[tokio::test(start_paused = true)]
async fn listeners_get_unsolicited_frames() {
    let (bus, sim) = bus_with(Vec::new());
    let (handle1, mut stream1) = bus.add_message_callback();
    let (_handle2, mut stream2) = bus.add_message_callback();

    sim.inject_frame16([0x05, 0x00]);
    for mut stream in [&mut stream1, &mut stream2] {
        match stream.next().await.map(|e| e.event_type) {
            Some(DaliBusEventType::Frame16([0x05, 0x00])) => {}
            e => panic!("unexpected event {:?}", e),
        }
    }

    bus.remove_message_callback(handle1);
    sim.inject_frame16([0x07, 0x05]);
    match stream2.next().await.map(|e| e.event_type) {
        Some(DaliBusEventType::Frame16([0x07, 0x05])) => {}
        e => panic!("unexpected event {:?}", e),
    }
    // removal drops the sender, so the first stream just ends
    assert!(stream1.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn bus_is_locked_during_addressing() {
    let (transport, _sim) = sim_bus();
    let (handle, _join) = dispatcher::start(Box::new(transport));
    let guard = handle.lock_exclusive().unwrap();
    assert!(matches!(
        handle.lock_exclusive().err(),
        Some(DaliSendResult::Busy)
    ));
    match handle
        .send_frame(DaliFrame::Frame16(cmd::TERMINATE().0), NO_FLAG)
        .await
    {
        DaliSendResult::Busy => {}
        r => panic!("expected Busy, got {:?}", r),
    }
    // the guard itself may keep talking
    long_address::set_search_addr(&guard, 0x001234).await.unwrap();
    drop(guard);
    send16::cmd(&handle, cmd::TERMINATE())
        .await
        .check_send()
        .unwrap();
    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn query_random_address_of_addressed_gear() {
    let (transport, sim) = sim_bus();
    sim.add_gear(SimGear::new(0x0000aa, 1).with_short_address(5));
    sim.with_gears(|gears| gears[0].random_address = 0x123456);
    let (handle, _join) = dispatcher::start(Box::new(transport));
    let long = long_address::query_random_addr(&handle, Short::new(5))
        .await
        .unwrap();
    assert_eq!(long, 0x123456);
    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_scan_terminates_addressing_mode() {
    let (bus, sim) = bus_with(vec![SimGear::new(0x0000aa, 1).with_random(0x000400)]);
    let control = ScanControl::new();
    control.cancel();
    match bus
        .scan_for_gear_cancellable(ScanOptions::default(), &control)
        .await
    {
        Err(ScanError::Cancelled) => {}
        r => panic!("expected cancellation, got {:?}", r.err()),
    }
    let writes = sim.writes();
    assert_eq!(
        writes.last().map(|w| w.frame.clone()),
        Some(DaliFrame::Frame16(cmd::TERMINATE().0)),
        "TERMINATE must close the addressing mode on cancellation"
    );
}

#[tokio::test(start_paused = true)]
async fn identity_failure_keeps_device_out_of_registry() {
    let mut broken = SimGear::new(0x0000aa, 1).with_random(0x000500);
    broken.fail_memory_reads = true;
    let (bus, sim) = bus_with(vec![broken]);
    let report = bus.scan_for_gear(ScanOptions::default()).await.unwrap();
    assert!(report.devices.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(bus.devices().is_empty());
    // the device still got its short address
    sim.with_gears(|gears| assert_eq!(gears[0].short_address, 0));
}

#[tokio::test(start_paused = true)]
async fn exhausted_address_space_is_reported() {
    let mut gears: Vec<SimGear> = (0u8..64)
        .map(|n| SimGear::new(0x0000aa, n as u64 + 1).with_short_address(n))
        .collect();
    gears.push(SimGear::new(0x0000bb, 100).with_random(0x123456));
    let (bus, _sim) = bus_with(gears);
    match bus.scan_for_gear(ScanOptions::default()).await {
        Err(ScanError::AddressSpaceExhausted) => {}
        r => panic!("expected exhaustion, got {:?}", r.err()),
    }
}

#[tokio::test(start_paused = true)]
async fn random_address_clash_is_resolved() {
    // both devices roll the same address first, then distinct ones
    let mut a = SimGear::new(0x0000aa, 1).with_random(0x005000);
    a.random_plan.push_back(0x001000);
    let mut b = SimGear::new(0x0000bb, 2).with_random(0x005000);
    b.random_plan.push_back(0x002000);
    let (bus, _sim) = bus_with(vec![a, b]);
    let report = bus.scan_for_gear(ScanOptions::default()).await.unwrap();
    assert_eq!(report.devices.len(), 2);
    let shorts: HashSet<u8> = report
        .devices
        .iter()
        .map(|d| d.short_address.unwrap().value())
        .collect();
    assert_eq!(shorts.len(), 2);
}
