//! 缓存层
//!
//! 块缓存是一组固定数量的缓冲区，每个保存一个磁盘块的副本。缓存磁盘块既减少了
//! 磁盘读取，也为多个进程共同使用的块提供了同步点。
//!
//! 接口：
//! * 用 [`Bcache::bread`] 取得某个磁盘块的缓冲区；
//! * 修改缓冲区数据后，用 [`Buf::bwrite`] 写回磁盘；
//! * 用完后丢弃 [`Buf`]（或调用 [`Buf::brelse`]）释放它；
//! * 同一时刻只有一个进程能使用某个缓冲区，所以不要持有太久。
//!
//! 缓冲区按块号散列到 [`NBUCKET`] 个桶中，每个桶是一条带哨兵的循环双向链表，
//! 由该桶自己的自旋锁保护，以降低锁竞争。未命中时从目标桶开始依次扫描各桶，
//! 选出第一个含空闲缓冲区的桶里时间戳最旧的那个，必要时把它迁移到目标桶。

use array_macro::array;

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use log::{debug, trace};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::error::{Error, Result};
use crate::process::Scheduler;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use crate::timer::Ticks;

/// 尚未装入任何块的缓冲区所属的设备号，不会与真实设备冲突
pub const NODEV: u32 = u32::MAX;

#[inline]
fn bucket_hash(blockno: u32) -> usize {
    blockno as usize % NBUCKET
}

/// 块缓冲区缓存。
///
/// `Bcache` 提供了一个固定大小的缓冲区池，缓冲区在构造时一次性建好，此后只会被
/// 重新标识为其他块，从不单独销毁。它依赖的块设备、调度器和时钟计数由调用者构造并借给它。
pub struct Bcache<'k> {
    disk: &'k dyn BlockDevice,
    sched: &'k dyn Scheduler,
    ticks: &'k Ticks,

    /// 串行化淘汰扫描。持有者是唯一可能同时持有两把桶锁的执行流，
    /// 加锁顺序固定为：淘汰锁、目标桶、其他桶。
    evict: SpinLock<()>,

    /// 每个桶的自旋锁，保护当前链接在该桶中的缓冲区的元数据
    buckets: [SpinLock<()>; NBUCKET],

    /// 前 `NBUF` 项对应各缓冲区，之后 `NBUCKET` 项是各桶链表的哨兵
    ctrl: [BufCtrl; NBUF + NBUCKET],

    /// 缓冲区的数据与有效位
    bufs: [BufInner; NBUF],
}

impl<'k> Bcache<'k> {
    /// 构造缓存并初始化各桶链表。
    ///
    /// 所有缓冲区起初都挂在 0 号桶上，设备号为 [`NODEV`]，首次被淘汰时再迁移到各自的桶。
    pub fn new(disk: &'k dyn BlockDevice, sched: &'k dyn Scheduler, ticks: &'k Ticks) -> Self {
        let cache = Self {
            disk,
            sched,
            ticks,
            evict: SpinLock::new((), "bcache_evict"),
            buckets: array![_ => SpinLock::new((), "bcache_bucket"); NBUCKET],
            ctrl: array![_ => BufCtrl::new(); NBUF + NBUCKET],
            bufs: array![_ => BufInner::new(); NBUF],
        };

        for bucket in 0..NBUCKET {
            let head = Self::head(bucket);
            cache.ctrl[head].prev.store(head, Ordering::Relaxed);
            cache.ctrl[head].next.store(head, Ordering::Relaxed);
        }
        for index in 0..NBUF {
            cache.link_front(0, index);
        }

        #[cfg(feature = "verbose_init_info")]
        log::info!("bcache: {} buffers in {} buckets", NBUF, NBUCKET);

        cache
    }

    /// 查找设备 `dev` 上的块 `blockno`，未缓存时回收一个缓冲区。
    ///
    /// # 功能说明
    /// 两种情况下都返回已加独占锁的缓冲区。命中时增加使用计数并刷新时间戳；
    /// 未命中时按 LRU 回收一个使用计数为 0 的缓冲区，其有效位清零，内容未初始化。
    ///
    /// # 可能的错误
    /// 所有缓冲区都在使用中时返回 [`Error::NoBuffers`]。
    pub fn bget(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        let id = bucket_hash(blockno);

        let bucket = self.buckets[id].lock();
        if let Some(index) = self.find_cached(id, dev, blockno) {
            self.touch(index);
            drop(bucket);
            return Ok(self.buf(index, dev, blockno));
        }
        drop(bucket);

        let evict = self.evict.lock();
        let bucket = self.buckets[id].lock();

        // 等待淘汰锁期间，可能已有其他进程装入了同一个块
        if let Some(index) = self.find_cached(id, dev, blockno) {
            self.touch(index);
            drop(bucket);
            drop(evict);
            return Ok(self.buf(index, dev, blockno));
        }

        for i in 0..NBUCKET {
            let bid = (id + i) % NBUCKET;
            let other = if bid != id {
                Some(self.buckets[bid].lock())
            } else {
                None
            };

            if let Some(index) = self.lru_unused(bid) {
                if bid != id {
                    self.unlink(index);
                    self.link_front(id, index);
                    trace!("bcache: buf {} moved from bucket {} to {}", index, bid, id);
                }

                // 源桶锁仍然持有，没有人能在此期间 pin 它
                let ctrl = &self.ctrl[index];
                if ctrl.refcnt.load(Ordering::Relaxed) != 0 {
                    panic!("bget: victim {} in use", index);
                }
                debug!(
                    "bcache: recycle buf {} ({}, {}) -> ({}, {})",
                    index,
                    ctrl.dev.load(Ordering::Relaxed),
                    ctrl.blockno.load(Ordering::Relaxed),
                    dev,
                    blockno
                );
                ctrl.dev.store(dev, Ordering::Relaxed);
                ctrl.blockno.store(blockno, Ordering::Relaxed);
                ctrl.refcnt.store(1, Ordering::Relaxed);
                ctrl.timestamp.store(self.ticks.clock_read(), Ordering::Relaxed);
                self.bufs[index].valid.store(false, Ordering::Relaxed);

                drop(other);
                drop(bucket);
                drop(evict);
                return Ok(self.buf(index, dev, blockno));
            }
            drop(other);
        }

        Err(Error::NoBuffers)
    }

    /// 返回装有指定块内容的、已加锁的缓冲区。
    ///
    /// 缓冲区内容无效时先从磁盘读入。
    pub fn bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        let mut b = self.bget(dev, blockno)?;
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.rw(&mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        Ok(b)
    }

    /// 块当前的使用计数，未缓存时返回 `None`
    pub fn refcnt(&self, dev: u32, blockno: u32) -> Option<usize> {
        let id = bucket_hash(blockno);
        let bucket = self.buckets[id].lock();
        let rc = self
            .find_cached(id, dev, blockno)
            .map(|index| self.ctrl[index].refcnt.load(Ordering::Relaxed));
        drop(bucket);
        rc
    }

    /// 在睡眠锁释放之后调用，减少使用计数并刷新时间戳
    fn brelse(&self, index: usize, blockno: u32) {
        let bucket = self.buckets[bucket_hash(blockno)].lock();
        let ctrl = &self.ctrl[index];
        let rc = ctrl.refcnt.load(Ordering::Relaxed);
        if rc == 0 {
            panic!("brelse: buf {} not referenced", index);
        }
        ctrl.refcnt.store(rc - 1, Ordering::Relaxed);
        ctrl.timestamp.store(self.ticks.clock_read(), Ordering::Relaxed);
        drop(bucket);
    }

    fn bpin(&self, index: usize, blockno: u32) {
        let bucket = self.buckets[bucket_hash(blockno)].lock();
        self.ctrl[index].refcnt.fetch_add(1, Ordering::Relaxed);
        drop(bucket);
    }

    fn bunpin(&self, index: usize, blockno: u32) {
        let bucket = self.buckets[bucket_hash(blockno)].lock();
        let ctrl = &self.ctrl[index];
        let rc = ctrl.refcnt.load(Ordering::Relaxed);
        if rc == 0 {
            panic!("buf unpin not match");
        }
        ctrl.refcnt.store(rc - 1, Ordering::Relaxed);
        drop(bucket);
    }

    /// 构造缓冲区句柄并等待独占锁。调用时不得持有任何自旋锁。
    fn buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock(self.sched)),
        }
    }

    /// 命中时增加使用计数并刷新时间戳，需持有所在桶的锁
    fn touch(&self, index: usize) {
        let ctrl = &self.ctrl[index];
        ctrl.refcnt.fetch_add(1, Ordering::Relaxed);
        ctrl.timestamp.store(self.ticks.clock_read(), Ordering::Relaxed);
    }

    #[inline]
    fn head(bucket: usize) -> usize {
        NBUF + bucket
    }

    fn iter(&self, bucket: usize) -> BucketIter<'_, 'k> {
        let head = Self::head(bucket);
        BucketIter {
            cache: self,
            head,
            cur: self.ctrl[head].next.load(Ordering::Relaxed),
        }
    }

    fn find_cached(&self, bucket: usize, dev: u32, blockno: u32) -> Option<usize> {
        self.iter(bucket).find(|&index| {
            let ctrl = &self.ctrl[index];
            ctrl.dev.load(Ordering::Relaxed) == dev && ctrl.blockno.load(Ordering::Relaxed) == blockno
        })
    }

    /// 桶中使用计数为 0 且时间戳最旧的缓冲区
    fn lru_unused(&self, bucket: usize) -> Option<usize> {
        self.iter(bucket)
            .filter(|&index| self.ctrl[index].refcnt.load(Ordering::Relaxed) == 0)
            .min_by_key(|&index| self.ctrl[index].timestamp.load(Ordering::Relaxed))
    }

    /// 头插到 `bucket` 中，需持有该桶的锁
    fn link_front(&self, bucket: usize, index: usize) {
        let head = Self::head(bucket);
        let first = self.ctrl[head].next.load(Ordering::Relaxed);
        self.ctrl[index].next.store(first, Ordering::Relaxed);
        self.ctrl[index].prev.store(head, Ordering::Relaxed);
        self.ctrl[first].prev.store(index, Ordering::Relaxed);
        self.ctrl[head].next.store(index, Ordering::Relaxed);
    }

    /// 从所在桶中摘下，需持有该桶的锁
    fn unlink(&self, index: usize) {
        let prev = self.ctrl[index].prev.load(Ordering::Relaxed);
        let next = self.ctrl[index].next.load(Ordering::Relaxed);
        self.ctrl[next].prev.store(prev, Ordering::Relaxed);
        self.ctrl[prev].next.store(next, Ordering::Relaxed);
    }
}

/// 沿桶链表前进，直到回到哨兵
struct BucketIter<'a, 'k> {
    cache: &'a Bcache<'k>,
    head: usize,
    cur: usize,
}

impl Iterator for BucketIter<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == self.head {
            return None;
        }
        let index = self.cur;
        self.cur = self.cache.ctrl[index].next.load(Ordering::Relaxed);
        Some(index)
    }
}

/// 已加独占锁的缓冲区句柄。
///
/// 句柄存在期间持有该缓冲区的睡眠锁；丢弃时先释放睡眠锁，再减少使用计数。
pub struct Buf<'a> {
    cache: &'a Bcache<'a>,
    index: usize,
    dev: u32,
    blockno: u32,
    /// 只在 `drop` 中被取走
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        match &self.data {
            Some(guard) => &**guard,
            None => panic!("buf {} used after release", self.index),
        }
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        match &mut self.data {
            Some(guard) => &mut **guard,
            None => panic!("buf {} used after release", self.index),
        }
    }

    /// 把缓冲区内容同步写回磁盘。调用者必须持有该缓冲区的独占锁。
    pub fn bwrite(&mut self) {
        match &self.data {
            Some(guard) if guard.holding() => {}
            _ => panic!("bwrite"),
        }
        let cache = self.cache;
        cache.disk.rw(self, true);
    }

    /// 释放缓冲区，等同于丢弃句柄
    pub fn brelse(self) {
        drop(self);
    }

    /// 增加使用计数，使块在释放后仍留在缓存中（日志层在提交前使用）。
    ///
    /// 返回的 [`BufPin`] 不持有独占锁，撤销时只需要桶锁。
    pub fn pin(&self) -> BufPin<'a> {
        self.cache.bpin(self.index, self.blockno);
        BufPin {
            cache: self.cache,
            index: self.index,
            blockno: self.blockno,
        }
    }
}

/// 一次 [`Buf::pin`] 留下的引用。
///
/// 存在期间该块不会被换出；`unpin` 或丢弃时撤销，不需要等待块的独占锁。
#[must_use = "dropping a BufPin unpins the block immediately"]
pub struct BufPin<'a> {
    cache: &'a Bcache<'a>,
    index: usize,
    blockno: u32,
}

impl<'a> BufPin<'a> {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 撤销这次 pin，等同于丢弃句柄
    pub fn unpin(self) {
        drop(self);
    }
}

impl<'a> Drop for BufPin<'a> {
    fn drop(&mut self) {
        self.cache.bunpin(self.index, self.blockno);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.brelse(self.index, self.blockno);
    }
}

/// 缓冲区元数据。
///
/// 各字段只在持有该缓冲区当前所在桶的锁时读写，锁本身提供顺序保证，
/// 因此原子操作一律使用 `Relaxed`。
struct BufCtrl {
    dev: AtomicU32,
    blockno: AtomicU32,
    /// 使用计数
    refcnt: AtomicUsize,
    /// 最近一次使用时的时钟计数
    timestamp: AtomicUsize,
    prev: AtomicUsize,
    next: AtomicUsize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: AtomicU32::new(NODEV),
            blockno: AtomicU32::new(0),
            refcnt: AtomicUsize::new(0),
            timestamp: AtomicUsize::new(0),
            prev: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
        }
    }
}

struct BufInner {
    /// 数据是否已从磁盘读入
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// 一个磁盘块的数据
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
