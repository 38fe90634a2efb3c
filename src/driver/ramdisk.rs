//! 内存盘
//!
//! 以内存数组充当块设备，读写同步完成，并记录读写次数便于观察缓存命中情况。

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::consts::fs::BSIZE;
use crate::fs::Buf;
use crate::spinlock::SpinLock;
use super::BlockDevice;

pub struct RamDisk {
    blocks: SpinLock<Vec<[u8; BSIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// 创建 `nblocks` 个全零块的内存盘
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: SpinLock::new(vec![[0; BSIZE]; nblocks], "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 已完成的读次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已完成的写次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接读出一个块的副本
    pub fn block(&self, blockno: u32) -> [u8; BSIZE] {
        let blocks = self.blocks.lock();
        blocks[Self::index(&blocks, blockno)]
    }

    /// 绕过缓存直接改写一个块
    pub fn set_block(&self, blockno: u32, data: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock();
        let i = Self::index(&blocks, blockno);
        blocks[i] = *data;
    }

    fn index(blocks: &[[u8; BSIZE]], blockno: u32) -> usize {
        let i = blockno as usize;
        if i >= blocks.len() {
            panic!("ramdisk: block {} out of range", blockno);
        }
        i
    }
}

impl BlockDevice for RamDisk {
    /// 内存盘只有一个设备，忽略 `buf.dev()`
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        let mut blocks = self.blocks.lock();
        let i = Self::index(&blocks, buf.blockno());
        if writing {
            blocks[i].copy_from_slice(&buf.data()[..]);
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            buf.data_mut().copy_from_slice(&blocks[i]);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        drop(blocks);
        trace!(
            "ramdisk: {} block {}",
            if writing { "write" } else { "read" },
            buf.blockno()
        );
    }
}
