//! 接收通道
//!
//! 把中断上下文中收到的帧排队，交给一个专门的消费者进程处理，
//! 使协议处理逻辑不必运行在中断处理程序里。

use alloc::collections::VecDeque;

use log::trace;

use crate::process::Scheduler;
use crate::spinlock::SpinLock;
use super::{MBuf, NetRx};

/// 先进先出的帧队列，驱动端通过 [`NetRx`] 入队，消费者用 [`RxChannel::recv`] 取出。
///
/// 消费者在持有 `wait` 时检查队列并睡眠，生产者入队后再取 `wait` 唤醒，
/// 因此不会丢失唤醒。
pub struct RxChannel<'k> {
    queue: SpinLock<VecDeque<MBuf>>,
    wait: SpinLock<()>,
    sched: &'k dyn Scheduler,
}

impl<'k> RxChannel<'k> {
    pub fn new(sched: &'k dyn Scheduler) -> Self {
        Self {
            queue: SpinLock::new(VecDeque::new(), "rx_queue"),
            wait: SpinLock::new((), "rx_wait"),
            sched,
        }
    }

    /// 取出最早到达的帧，队列为空时睡眠等待
    pub fn recv(&self) -> MBuf {
        let mut guard = self.wait.lock();
        loop {
            if let Some(m) = self.queue.lock().pop_front() {
                drop(guard);
                return m;
            }
            self.sched.sleep(self.channel(), guard);
            guard = self.wait.lock();
        }
    }

    /// 取出最早到达的帧，不等待
    pub fn try_recv(&self) -> Option<MBuf> {
        self.queue.lock().pop_front()
    }

    /// 队列中等待处理的帧数
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn channel(&self) -> usize {
        &self.wait as *const SpinLock<()> as usize
    }
}

impl<'k> NetRx for RxChannel<'k> {
    fn net_rx(&self, m: MBuf) {
        trace!("rx channel: queue frame of {} bytes", m.len());
        self.queue.lock().push_back(m);
        let guard = self.wait.lock();
        self.sched.wakeup(self.channel());
        drop(guard);
    }
}
