//! 时钟计数
//!
//! 缓冲区缓存用它给块打上“最近使用时间”，LRU 淘汰比较的就是这个值。

use core::num::Wrapping;

use crate::spinlock::SpinLock;

/// 系统时钟计数器（自旋锁保护）
///
/// 由时钟中断推进，读取者在自己的临界区内短暂持有它的锁。
pub struct Ticks(SpinLock<Wrapping<usize>>);

impl Ticks {
    pub const fn new() -> Self {
        Self(SpinLock::new(Wrapping(0), "time"))
    }

    /// 处理时钟中断（更新计数器）
    ///
    /// 返回推进后的计数值。
    pub fn clock_intr(&self) -> usize {
        let mut guard = self.0.lock();
        *guard += Wrapping(1);
        guard.0
    }

    /// 读取当前时钟计数值
    pub fn clock_read(&self) -> usize {
        self.0.lock().0
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}
