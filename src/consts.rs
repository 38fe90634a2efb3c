//! 内核参数与内存布局常量

/// 页大小
pub const PGSIZE: usize = 4096;
/// 页内偏移位数
pub const PGSHIFT: usize = 12;

/// 每级页表索引占 9 位
pub const PGMASKLEN: usize = 9;
pub const PGMASK: usize = 0x1FF;

/// Sv39 页表项中物理页号之前的标志位数
pub const SV39FLAGLEN: usize = 10;

/// 比 Sv39 允许的最大虚拟地址还小一位，避免处理高位符号扩展
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// 分配出去的页先填满该值，暴露对未初始化内存的使用
pub const ALLOC_JUNK: u8 = 5;
/// 释放的页填满该值，暴露悬空引用
pub const FREE_JUNK: u8 = 1;

pub mod fs {
    /// 一个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;
    /// 磁盘块大小
    pub const BSIZE: usize = 512;
    /// 块缓存中的缓冲区个数
    pub const NBUF: usize = MAXOPBLOCKS * 3;
    /// 块缓存的哈希桶个数，取素数使块号分布均匀
    pub const NBUCKET: usize = 13;
}

pub mod driver {
    /// 发送描述符环的槽位数
    pub const TX_RING_SIZE: usize = 16;
    /// 接收描述符环的槽位数
    pub const RX_RING_SIZE: usize = 16;
    /// qemu 分配给 e1000 的 MAC 地址 52:54:00:12:34:56
    pub const E1000_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
}

pub mod net {
    /// 报文缓冲区的容量
    pub const MBUF_SIZE: usize = 2048;
    /// 协议栈发送时为各层头部预留的空间
    pub const MBUF_DEFAULT_HEADROOM: usize = 128;
}
