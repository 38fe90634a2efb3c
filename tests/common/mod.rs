//! 集成测试共用的宿主端协作者

#![allow(dead_code)]

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use xv6_resource::consts::PGSIZE;
use xv6_resource::driver::e1000_dev::{RDBAH, RDBAL, REGS_LEN, TDBAH, TDBAL};
use xv6_resource::net::{MBuf, NetRx};
use xv6_resource::process::Scheduler;
use xv6_resource::spinlock::SpinLockGuard;

/// 基于 std 线程的调度器。
///
/// 每次 wakeup 递增代计数并唤醒所有睡眠者，调用者醒来后会重新检查条件。
pub struct StdScheduler {
    generation: Mutex<u64>,
    cv: Condvar,
}

static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static PID: Cell<usize> = const { Cell::new(0) };
}

impl StdScheduler {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }
}

impl Scheduler for StdScheduler {
    fn pid(&self) -> usize {
        PID.with(|pid| {
            if pid.get() == 0 {
                pid.set(NEXT_PID.fetch_add(1, Ordering::Relaxed));
            }
            pid.get()
        })
    }

    fn sleep(&self, _channel: usize, guard: SpinLockGuard<'_, ()>) {
        let generation = self.generation.lock().unwrap();
        let seen = *generation;
        drop(guard);
        let _ = self
            .cv
            .wait_timeout_while(generation, Duration::from_millis(10), |g| *g == seen)
            .unwrap();
    }

    fn wakeup(&self, _channel: usize) {
        *self.generation.lock().unwrap() += 1;
        self.cv.notify_all();
    }
}

#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

/// 泄漏 `npages` 个页对齐的页，返回 `[start, end)`
pub fn arena(npages: usize) -> (usize, usize) {
    let pages: Vec<Page> = (0..npages).map(|_| Page([0; PGSIZE])).collect();
    let pages = pages.leak();
    let start = pages.as_mut_ptr() as usize;
    (start, start + npages * PGSIZE)
}

pub fn page_bytes(pa: usize) -> &'static mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(pa as *mut u8, PGSIZE) }
}

/// 按到达顺序记录每个上交的帧
#[derive(Default)]
pub struct Collect(Mutex<Vec<Vec<u8>>>);

impl Collect {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

impl NetRx for Collect {
    fn net_rx(&self, m: MBuf) {
        self.0.lock().unwrap().push(m.as_slice().to_vec());
    }
}

const TXD_STATUS: usize = 12;
const RXD_LENGTH: usize = 8;
const RXD_STATUS: usize = 12;
const DESC_SIZE: usize = 16;

/// 模拟网卡：一组寄存器加上驱动收发环所需的最少设备行为。
///
/// 通过基址寄存器找到环，并像硬件那样把描述符标记为完成。
pub struct MockNic {
    regs: *mut u32,
}

impl MockNic {
    pub fn new() -> Self {
        let regs = Box::leak(vec![0u32; REGS_LEN].into_boxed_slice());
        Self {
            regs: regs.as_mut_ptr(),
        }
    }

    pub fn regs(&self) -> *mut u32 {
        self.regs
    }

    pub fn reg(&self, reg: usize) -> u32 {
        assert!(reg < REGS_LEN);
        unsafe { ptr::read_volatile(self.regs.add(reg)) }
    }

    pub fn set_reg(&self, reg: usize, val: u32) {
        assert!(reg < REGS_LEN);
        unsafe { ptr::write_volatile(self.regs.add(reg), val) }
    }

    fn ring(&self, lo: usize, hi: usize) -> *mut u8 {
        ((self.reg(hi) as u64) << 32 | self.reg(lo) as u64) as usize as *mut u8
    }

    fn tx_slot(&self, i: usize) -> *mut u8 {
        unsafe { self.ring(TDBAL, TDBAH).add(i * DESC_SIZE) }
    }

    fn rx_slot(&self, i: usize) -> *mut u8 {
        unsafe { self.ring(RDBAL, RDBAH).add(i * DESC_SIZE) }
    }

    pub fn tx_status(&self, i: usize) -> u8 {
        unsafe { ptr::read_volatile(self.tx_slot(i).add(TXD_STATUS)) }
    }

    pub fn tx_addr(&self, i: usize) -> u64 {
        unsafe { ptr::read_volatile(self.tx_slot(i) as *const u64) }
    }

    pub fn tx_len(&self, i: usize) -> u16 {
        unsafe { ptr::read_volatile(self.tx_slot(i).add(8) as *const u16) }
    }

    /// 设备发送完 `i` 号槽
    pub fn complete_tx(&self, i: usize) {
        let status = self.tx_status(i);
        unsafe { ptr::write_volatile(self.tx_slot(i).add(TXD_STATUS), status | 1) }
    }

    pub fn rx_status(&self, i: usize) -> u8 {
        unsafe { ptr::read_volatile(self.rx_slot(i).add(RXD_STATUS)) }
    }

    pub fn rx_addr(&self, i: usize) -> u64 {
        unsafe { ptr::read_volatile(self.rx_slot(i) as *const u64) }
    }

    /// 设备把 `frame` 写入 `i` 号槽并置上 DD | EOP
    pub fn fill_rx(&self, i: usize, frame: &[u8]) {
        let dst = self.rx_addr(i) as usize as *mut u8;
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), dst, frame.len());
            ptr::write_volatile(self.rx_slot(i).add(RXD_LENGTH) as *mut u16, frame.len() as u16);
            ptr::write_volatile(self.rx_slot(i).add(RXD_STATUS), 0b11);
        }
    }
}
