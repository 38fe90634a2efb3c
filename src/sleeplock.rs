//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。
//! 缓冲区缓存用它实现“块的独占使用”，持锁期间允许进行磁盘 I/O。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::Scheduler;
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`pid`状态的访问
/// - `locked`: 表示锁是否已被占用
/// - `pid`: 持有者的标识，供 [`SleepLock::holding`] 检查
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    pid: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            pid: Cell::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 功能说明
    /// 尝试获取睡眠锁。如果锁已被占用，当前进程将通过 `sched` 进入休眠状态，
    /// 直到锁被释放后被唤醒。返回守卫对象提供对数据的访问。
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`让当前进程休眠，醒来后重新加锁再检查
    ///   - 如果未锁定：设置`locked=true`、记录持有者并返回守卫
    /// 3. 释放内部自旋锁（因已设置locked状态）
    pub fn lock<'a>(&'a self, sched: &'a dyn Scheduler) -> SleepLockGuard<'a, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            sched.sleep(self.channel(), guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.pid.set(sched.pid());
        drop(guard);

        SleepLockGuard {
            lock: self,
            sched,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前进程是否持有该锁
    pub fn holding(&self, sched: &dyn Scheduler) -> bool {
        let guard = self.lock.lock();
        let held = self.locked.get() && self.pid.get() == sched.pid();
        drop(guard);
        held
    }

    /// 锁的名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self, sched: &dyn Scheduler) {
        let guard = self.lock.lock();
        if !self.locked.get() {
            panic!("sleeplock {} unlock", self.name);
        }
        self.locked.set(false);
        self.pid.set(0);
        sched.wakeup(self.channel());
        drop(guard);
    }

    #[inline]
    fn channel(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    sched: &'a dyn Scheduler,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 守卫对应的锁是否确实由当前进程持有
    pub fn holding(&self) -> bool {
        self.lock.holding(self.sched)
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.sched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinlock::SpinLockGuard;

    use std::cell::Cell as StdCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    struct Yield;

    std::thread_local! {
        static PID: StdCell<usize> = const { StdCell::new(0) };
    }
    static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

    impl Scheduler for Yield {
        fn pid(&self) -> usize {
            PID.with(|p| {
                if p.get() == 0 {
                    p.set(NEXT_PID.fetch_add(1, Ordering::Relaxed));
                }
                p.get()
            })
        }

        fn sleep(&self, _channel: usize, guard: SpinLockGuard<'_, ()>) {
            drop(guard);
            thread::yield_now();
        }

        fn wakeup(&self, _channel: usize) {}
    }

    #[test]
    fn holder_is_recorded() {
        let sched = Yield;
        let lock = SleepLock::new(0u32, "holder");
        assert!(!lock.holding(&sched));
        let guard = lock.lock(&sched);
        assert!(guard.holding());
        drop(guard);
        assert!(!lock.holding(&sched));
    }

    #[test]
    fn other_thread_does_not_hold() {
        static SCHED: Yield = Yield;
        let lock = Arc::new(SleepLock::new((), "other"));
        let guard = lock.lock(&SCHED);
        let peer = Arc::clone(&lock);
        let held = thread::spawn(move || peer.holding(&SCHED)).join().unwrap();
        assert!(!held);
        drop(guard);
    }

    #[test]
    fn serializes_holders() {
        static SCHED: Yield = Yield;
        let lock = Arc::new(SleepLock::new(0usize, "count"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut guard = lock.lock(&SCHED);
                        let v = *guard;
                        thread::yield_now();
                        *guard = v + 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(&SCHED), 800);
    }
}
