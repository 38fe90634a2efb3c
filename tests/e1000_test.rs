//! 在模拟寄存器组上测试 E1000 收发环

mod common;

use std::thread;

use common::{Collect, MockNic, StdScheduler};
use xv6_resource::driver::e1000_dev::*;
use xv6_resource::driver::{TxStatus, E1000};
use xv6_resource::net::{MBuf, RxChannel};
use xv6_resource::Error;

fn frame(payload: &[u8]) -> MBuf {
    let mut m = MBuf::alloc(64);
    m.put(payload.len()).copy_from_slice(payload);
    m
}

#[test]
fn init_programs_device() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e: E1000<'_> = unsafe { E1000::new(nic.regs(), &net) }.unwrap();

    assert_eq!(nic.reg(TDH), 0);
    assert_eq!(nic.reg(TDT), 0);
    assert_eq!(nic.reg(TDLEN), 16 * 16);
    assert_eq!(nic.reg(RDH), 0);
    assert_eq!(nic.reg(RDT), 15);
    assert_eq!(nic.reg(RDLEN), 16 * 16);
    assert_ne!(nic.reg(CTL) & (1 << CTL_RST_BIT), 0);

    assert_eq!(nic.reg(RA), 0x1200_5452);
    assert_eq!(nic.reg(RA + 1), 0x8000_5634);
    assert_eq!(nic.reg(TCTL), 0x0004_010a);
    assert_eq!(nic.reg(TIPG), 10 | (8 << 10) | (6 << 20));
    assert_eq!(nic.reg(RCTL), 0x0400_8002);
    assert_eq!(nic.reg(IMS), 1 << IMS_RXDW_BIT);

    for i in 0..16 {
        assert_eq!(nic.tx_status(i), TxdStat::DD.bits());
        assert_eq!(nic.rx_status(i), 0);
        assert_ne!(nic.rx_addr(i), 0);
    }
    let mut addrs: Vec<u64> = (0..16).map(|i| nic.rx_addr(i)).collect();
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), 16);

    drop(e);
    assert_eq!(nic.reg(IMS), 0);
    assert_eq!(nic.reg(RCTL), 0);
}

#[test]
fn ring_size_must_be_whole_cache_lines() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e = unsafe { E1000::<4, 8>::new(nic.regs(), &net) };
    assert!(matches!(e, Err(Error::RingSize)));
    // 寄存器未被改动
    assert_eq!(nic.reg(TCTL), 0);

    let e = unsafe { E1000::<8, 8>::new(std::ptr::null_mut(), &net) };
    assert!(matches!(e, Err(Error::BadAddress)));
}

#[test]
fn transmit_installs_frame_and_advances_tail() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e = unsafe { E1000::<8, 8>::new(nic.regs(), &net) }.unwrap();

    let m = frame(b"hello");
    let addr = m.head_addr();
    assert!(matches!(e.transmit(m), TxStatus::Sent));

    assert_eq!(nic.reg(TDT), 1);
    assert_eq!(nic.tx_addr(0), addr);
    assert_eq!(nic.tx_len(0), 5);
    assert_eq!(nic.tx_status(0), 0);
}

#[test]
fn full_ring_pushes_back() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e = unsafe { E1000::<8, 8>::new(nic.regs(), &net) }.unwrap();

    for i in 0..8u8 {
        assert!(matches!(e.transmit(frame(&[i])), TxStatus::Sent));
    }
    assert_eq!(nic.reg(TDT), 0);
    let installed = nic.tx_addr(0);

    // 0 号槽还没有发送完成
    let m = match e.transmit(frame(b"ninth")) {
        TxStatus::Busy(m) => m,
        TxStatus::Sent => panic!("slot 0 was not reclaimed"),
    };
    assert_eq!(m.as_slice(), b"ninth");
    assert_eq!(nic.reg(TDT), 0);
    assert_eq!(nic.tx_addr(0), installed);
    assert_eq!(nic.tx_status(0), 0);

    nic.complete_tx(0);
    let addr = m.head_addr();
    assert!(matches!(e.transmit(m), TxStatus::Sent));
    assert_eq!(nic.reg(TDT), 1);
    assert_eq!(nic.tx_addr(0), addr);

    // 1 号槽仍归设备所有
    assert!(matches!(e.transmit(frame(b"tenth")), TxStatus::Busy(_)));
}

#[test]
fn prompt_completion_never_blocks() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e = unsafe { E1000::<8, 8>::new(nic.regs(), &net) }.unwrap();

    for i in 0..9u8 {
        let slot = nic.reg(TDT) as usize;
        assert!(matches!(e.transmit(frame(&[i])), TxStatus::Sent));
        nic.complete_tx(slot);
    }
    assert_eq!(nic.reg(TDT), 1);
}

#[test]
fn receive_drains_completed_slots_in_order() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e = unsafe { E1000::<8, 8>::new(nic.regs(), &net) }.unwrap();
    assert_eq!(nic.reg(RDT), 7);

    let before: Vec<u64> = (0..8).map(|i| nic.rx_addr(i)).collect();
    nic.fill_rx(0, b"one");
    nic.fill_rx(1, b"two");
    nic.fill_rx(2, b"three");

    assert_eq!(e.recv(), 3);
    assert_eq!(net.frames(), vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

    // 三个新缓冲区已交还设备，状态清零
    for i in 0..3 {
        assert_ne!(nic.rx_addr(i), before[i]);
        assert_ne!(nic.rx_addr(i), 0);
        assert_eq!(nic.rx_status(i), 0);
    }
    assert_eq!(nic.rx_addr(3), before[3]);

    // RDT 指向最后交还的槽，下次从第四个槽开始检查
    assert_eq!(nic.reg(RDT), 2);
    assert_eq!(e.recv(), 0);

    nic.fill_rx(3, b"four");
    assert_eq!(e.recv(), 1);
    assert_eq!(nic.reg(RDT), 3);
    assert_eq!(net.frames().len(), 4);
}

#[test]
fn receive_wraps_around_the_ring() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e = unsafe { E1000::<8, 8>::new(nic.regs(), &net) }.unwrap();

    for round in 0..3u8 {
        for i in 0..5u8 {
            let slot = (nic.reg(RDT) as usize + 1 + i as usize) % 8;
            nic.fill_rx(slot, &[round, i]);
        }
        assert_eq!(e.recv(), 5);
    }
    assert_eq!(nic.reg(RDT), (15 + 7) % 8);
    let frames = net.frames();
    assert_eq!(frames.len(), 15);
    assert_eq!(frames[14], vec![2, 4]);
}

#[test]
fn interrupt_acknowledges_then_receives() {
    let nic = MockNic::new();
    let net = Collect::default();
    let e = unsafe { E1000::<8, 8>::new(nic.regs(), &net) }.unwrap();

    nic.set_reg(ICR, 1 << IMS_RXDW_BIT);
    nic.fill_rx(0, b"ping");
    assert_eq!(e.intr(), 1);
    assert_eq!(nic.reg(ICR), 0xffff_ffff);
    assert_eq!(net.frames(), vec![b"ping".to_vec()]);

    assert_eq!(e.intr(), 0);
}

#[test]
fn channel_hands_frames_to_a_consumer() {
    let nic = MockNic::new();
    let sched = StdScheduler::new();
    let chan = RxChannel::new(&sched);
    let e = unsafe { E1000::<8, 8>::new(nic.regs(), &chan) }.unwrap();

    assert!(chan.try_recv().is_none());

    thread::scope(|s| {
        let consumer = s.spawn(|| {
            (0..4)
                .map(|_| chan.recv().as_slice().to_vec())
                .collect::<Vec<_>>()
        });

        for i in 0..4u8 {
            nic.fill_rx(i as usize, &[i; 3]);
            assert_eq!(e.intr(), 1);
            thread::yield_now();
        }

        let got = consumer.join().unwrap();
        assert_eq!(got, (0..4u8).map(|i| vec![i; 3]).collect::<Vec<_>>());
    });
    assert!(chan.is_empty());
}
