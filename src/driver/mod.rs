//! 设备驱动模块，包含块设备接口、内存盘与 E1000 网卡驱动

use crate::fs::Buf;

pub mod e1000;
pub mod e1000_dev;
pub mod ramdisk;

pub use e1000::{E1000, TxStatus};
pub use ramdisk::RamDisk;

/// 块设备读写原语，供缓冲区缓存在未命中和写回时调用。
///
/// 调用时 `buf` 已由调用者独占加锁，实现可以睡眠等待 I/O 完成。
pub trait BlockDevice: Sync {
    /// `writing` 为真时把 `buf` 的内容写入块 `buf.blockno()`，否则从磁盘读入。
    fn rw(&self, buf: &mut Buf<'_>, writing: bool);
}
