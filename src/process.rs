//! 进程调度接口
//!
//! 调度与上下文切换不属于本层，资源管理器只通过 [`Scheduler`] 使用它提供的
//! 睡眠/唤醒原语：睡眠锁在块被占用时挂起调用者，接收通道在没有报文时挂起消费者。

use crate::spinlock::SpinLockGuard;

/// 调度器提供给资源管理层的最小接口。
///
/// 语义与 xv6 的 `sleep`/`wakeup` 一致：睡眠通道是一个地址（`usize`），
/// `sleep` 必须在当前执行流登记为睡眠之后再释放传入的自旋锁守卫，
/// 保证不会丢失在两者之间发生的 `wakeup`。
///
/// 调用者总是在被唤醒后重新获取锁并重新检查条件，因此允许虚假唤醒，
/// 一个只做让出处理器的实现也是正确的。
pub trait Scheduler: Sync {
    /// 当前执行流（进程或内核线程）的标识，用于记录睡眠锁的持有者。
    fn pid(&self) -> usize;

    /// 在 `channel` 上睡眠，并原子地释放 `guard`。
    ///
    /// 返回时 `guard` 对应的锁已经释放，调用者需要自行重新加锁。
    fn sleep(&self, channel: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在 `channel` 上睡眠的执行流。
    fn wakeup(&self, channel: usize);
}
