//! E1000 网卡驱动
//!
//! 发送与接收各用一个描述符环与网卡交接帧缓冲区，描述符的所有权由状态中的 DD 位表示：
//! * 发送：软件把帧装入 `TDT` 指向的槽位并推进 `TDT`，网卡发送完成后置 DD，
//!   下一次轮到该槽位时软件才释放旧缓冲区并复用它；
//! * 接收：网卡把帧写入 `RDH` 处的槽位并置 DD，软件从 `RDT+1` 开始依次取走已完成的槽位，
//!   换上新缓冲区后把 `RDT` 推进到该槽位，交还给网卡。
//!
//! 描述符环所在内存与寄存器都可能被网卡异步访问，一律用 volatile 读写。

use alloc::boxed::Box;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};

use bit_field::BitField;
use log::{debug, trace, warn};

use crate::consts::driver::{E1000_MAC, RX_RING_SIZE, TX_RING_SIZE};
use crate::error::{Error, Result};
use crate::net::{MBuf, NetRx};
use crate::spinlock::SpinLock;
use super::e1000_dev::*;

/// [`E1000::transmit`] 的结果
#[must_use]
#[derive(Debug)]
pub enum TxStatus {
    /// 帧已交给网卡，缓冲区归驱动所有
    Sent,
    /// 发送环已满，帧原样退还，调用者稍后重试
    Busy(MBuf),
}

/// E1000 网卡，`TX`、`RX` 为两个描述符环的槽位数。
pub struct E1000<'k, const TX: usize = TX_RING_SIZE, const RX: usize = RX_RING_SIZE> {
    regs: Regs,
    tx: SpinLock<TxRing<TX>>,
    rx: SpinLock<RxRing<RX>>,
    net: &'k dyn NetRx,
}

struct TxRing<const N: usize> {
    desc: DescRing<TxDesc, N>,
    /// 每个槽位上已交给网卡、等待发送完成后释放的缓冲区
    mbufs: [Option<MBuf>; N],
}

struct RxRing<const N: usize> {
    desc: DescRing<RxDesc, N>,
    /// 每个槽位上等待网卡写入的缓冲区
    mbufs: [MBuf; N],
}

impl<'k, const TX: usize, const RX: usize> E1000<'k, TX, RX> {
    /// 复位并初始化网卡，收到的帧交给 `net`。
    ///
    /// # 流程解释
    /// 1. 关中断后复位设备；
    /// 2. 发送环清零，每个槽位标记为已完成，使第一次发送可以直接进行；
    /// 3. 接收环清零，每个槽位预先装上一个新缓冲区，`RDT` 指向最后一个槽位；
    /// 4. 设置 MAC 过滤、清空组播表、配置收发控制寄存器，最后只打开接收写回中断。
    ///
    /// # 可能的错误
    /// - [`Error::BadAddress`]：`regs` 为空指针；
    /// - [`Error::RingSize`]：环为空，或环的字节数不是 128 的倍数。
    ///
    /// # 安全性
    /// `regs` 必须指向已映射的 E1000 寄存器空间，至少 [`REGS_LEN`] 个字，并在驱动存活期间有效。
    /// 只能在系统启动时调用一次，不能与收发并发。
    pub unsafe fn new(regs: *mut u32, net: &'k dyn NetRx) -> Result<Self> {
        let regs = Regs::new(regs).ok_or(Error::BadAddress)?;
        if TX == 0
            || RX == 0
            || (size_of::<TxDesc>() * TX) % 128 != 0
            || (size_of::<RxDesc>() * RX) % 128 != 0
        {
            return Err(Error::RingSize);
        }

        // 复位
        regs.write(IMS, 0);
        let mut ctl = regs.read(CTL);
        ctl.set_bit(CTL_RST_BIT, true);
        regs.write(CTL, ctl);
        regs.write(IMS, 0);
        fence(Ordering::SeqCst);

        // 发送初始化
        let mut tx_desc = DescRing::<TxDesc, TX>::new(TxDesc::EMPTY);
        for i in 0..TX {
            tx_desc.write(
                i,
                TxDesc {
                    status: TxdStat::DD.bits(),
                    ..TxDesc::EMPTY
                },
            );
        }
        let tx = TxRing {
            desc: tx_desc,
            mbufs: core::array::from_fn(|_| None),
        };
        regs.write_addr(TDBAL, TDBAH, tx.desc.addr());
        regs.write(TDLEN, (size_of::<TxDesc>() * TX) as u32);
        regs.write(TDH, 0);
        regs.write(TDT, 0);

        // 接收初始化
        let mut rx_desc = DescRing::<RxDesc, RX>::new(RxDesc::EMPTY);
        let rx_mbufs: [MBuf; RX] = core::array::from_fn(|_| MBuf::alloc(0));
        for (i, m) in rx_mbufs.iter().enumerate() {
            rx_desc.write(
                i,
                RxDesc {
                    addr: m.head_addr(),
                    ..RxDesc::EMPTY
                },
            );
        }
        let rx = RxRing {
            desc: rx_desc,
            mbufs: rx_mbufs,
        };
        regs.write_addr(RDBAL, RDBAH, rx.desc.addr());
        regs.write(RDH, 0);
        regs.write(RDT, (RX - 1) as u32);
        regs.write(RDLEN, (size_of::<RxDesc>() * RX) as u32);

        // 只接收发往本机 MAC 地址的帧
        let mac = E1000_MAC;
        regs.write(RA, u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]));
        let mut ra_hi = u16::from_le_bytes([mac[4], mac[5]]) as u32;
        ra_hi.set_bit(RA_AV_BIT, true);
        regs.write(RA + 1, ra_hi);
        for i in 0..MTA_LEN {
            regs.write(MTA + i, 0);
        }

        let mut tctl = (Tctl::EN | Tctl::PSP).bits();
        tctl.set_bits(TCTL_CT, 0x10);
        tctl.set_bits(TCTL_COLD, 0x40);
        regs.write(TCTL, tctl);
        let mut tipg = 0u32;
        tipg.set_bits(0..10, 10);
        tipg.set_bits(10..20, 8);
        tipg.set_bits(20..30, 6);
        regs.write(TIPG, tipg);

        regs.write(RCTL, (Rctl::EN | Rctl::BAM | Rctl::SECRC).bits() | RCTL_SZ_2048);

        // 每收到一帧就中断，不使用延迟计时器
        regs.write(RDTR, 0);
        regs.write(RADV, 0);
        let mut ims = 0u32;
        ims.set_bit(IMS_RXDW_BIT, true);
        regs.write(IMS, ims);

        #[cfg(feature = "verbose_init_info")]
        log::info!("e1000: tx ring {} slots, rx ring {} slots", TX, RX);

        Ok(Self {
            regs,
            tx: SpinLock::new(tx, "e1000_tx"),
            rx: SpinLock::new(rx, "e1000_rx"),
            net,
        })
    }

    /// 发送一帧。
    ///
    /// `TDT` 指向的槽位网卡尚未处理完时返回 [`TxStatus::Busy`] 并退还缓冲区，
    /// 此时环与寄存器都不被修改。成功时缓冲区归驱动所有，在该槽位下一次被复用时释放。
    pub fn transmit(&self, m: MBuf) -> TxStatus {
        let mut tx = self.tx.lock();
        let i = self.regs.read(TDT) as usize;
        if i >= TX {
            panic!("e1000: tdt {} out of range", i);
        }

        let desc = tx.desc.read(i);
        if !TxdStat::from_bits_truncate(desc.status).contains(TxdStat::DD) {
            trace!("e1000: tx slot {} busy", i);
            return TxStatus::Busy(m);
        }

        drop(tx.mbufs[i].take());
        tx.desc.write(
            i,
            TxDesc {
                addr: m.head_addr(),
                length: m.len() as u16,
                cmd: (TxdCmd::EOP | TxdCmd::RS).bits(),
                status: 0,
                ..TxDesc::EMPTY
            },
        );
        tx.mbufs[i] = Some(m);

        fence(Ordering::SeqCst);
        self.regs.write(TDT, ((i + 1) % TX) as u32);
        drop(tx);
        TxStatus::Sent
    }

    /// 取走所有已完成的接收槽位，按顺序交给上层，返回交付的帧数。
    ///
    /// 每个槽位先换上新缓冲区并清除状态，再通过 `RDT` 交还网卡，最后交付取下的帧。
    /// 遇到第一个未完成的槽位即停止。
    pub fn recv(&self) -> usize {
        let mut rx = self.rx.lock();
        let mut delivered = 0;
        loop {
            let i = (self.regs.read(RDT) as usize + 1) % RX;
            let desc = rx.desc.read(i);
            if !RxdStat::from_bits_truncate(desc.status).contains(RxdStat::DD) {
                break;
            }

            let fresh = MBuf::alloc(0);
            rx.desc.write(
                i,
                RxDesc {
                    addr: fresh.head_addr(),
                    ..RxDesc::EMPTY
                },
            );
            let mut m = core::mem::replace(&mut rx.mbufs[i], fresh);
            m.set_len(desc.length as usize);

            fence(Ordering::SeqCst);
            self.regs.write(RDT, i as u32);

            self.net.net_rx(m);
            delivered += 1;
        }
        drop(rx);

        if delivered > 0 {
            debug!("e1000: received {} frames", delivered);
        }
        delivered
    }

    /// 中断处理：确认中断原因后处理接收环，返回交付的帧数。
    ///
    /// 发送完成不单独处理，下一次发送时自然发现。
    pub fn intr(&self) -> usize {
        // 不确认的话网卡不会再发出中断
        self.regs.write(ICR, 0xffff_ffff);
        let delivered = self.recv();
        if delivered == 0 {
            warn!("e1000: interrupt with no received frames");
        }
        delivered
    }
}

impl<'k, const TX: usize, const RX: usize> Drop for E1000<'k, TX, RX> {
    /// 停止收发并关中断，之后描述符环才能释放
    fn drop(&mut self) {
        self.regs.write(IMS, 0);
        self.regs.write(RCTL, 0);
        self.regs.write(TCTL, 0);
        fence(Ordering::SeqCst);
    }
}

/// 寄存器空间
#[derive(Clone, Copy)]
struct Regs {
    base: NonNull<u32>,
}

// 寄存器按字独立访问，每次都是 volatile 读写
unsafe impl Send for Regs {}
unsafe impl Sync for Regs {}

impl Regs {
    fn new(base: *mut u32) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base })
    }

    #[inline]
    fn read(&self, reg: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.as_ptr().add(reg)) }
    }

    #[inline]
    fn write(&self, reg: usize, val: u32) {
        unsafe { ptr::write_volatile(self.base.as_ptr().add(reg), val) }
    }

    /// 把 64 位地址拆成低、高两个寄存器写入
    fn write_addr(&self, lo: usize, hi: usize, addr: u64) {
        self.write(lo, addr.get_bits(0..32) as u32);
        self.write(hi, addr.get_bits(32..64) as u32);
    }
}

/// 与网卡共享的描述符环。
///
/// 内存在堆上分配且地址固定，网卡随时可能读写，所以只通过裸指针做 volatile 访问，
/// 从不产生指向它的引用。
struct DescRing<T: Copy, const N: usize> {
    ptr: NonNull<[T; N]>,
}

unsafe impl<T: Copy + Send, const N: usize> Send for DescRing<T, N> {}

impl<T: Copy, const N: usize> DescRing<T, N> {
    fn new(init: T) -> Self {
        let ring = Box::new([init; N]);
        Self {
            ptr: NonNull::from(Box::leak(ring)),
        }
    }

    fn slot(&self, i: usize) -> *mut T {
        if i >= N {
            panic!("desc ring: slot {} out of range", i);
        }
        unsafe { self.ptr.as_ptr().cast::<T>().add(i) }
    }

    fn read(&self, i: usize) -> T {
        unsafe { ptr::read_volatile(self.slot(i)) }
    }

    fn write(&mut self, i: usize, desc: T) {
        unsafe { ptr::write_volatile(self.slot(i), desc) }
    }

    /// 环的物理地址，本内核中物理地址与内核虚拟地址一一对应
    fn addr(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }
}

impl<T: Copy, const N: usize> Drop for DescRing<T, N> {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}
