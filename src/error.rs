//! 错误类型
//!
//! 资源耗尽与不可恢复但可上报的状态以 [`Error`] 返回给直接调用者，
//! 由上层决定重试、上报还是停机。违反加锁约定属于编程错误，仍然直接 panic。

use core::{error, fmt};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 没有空闲物理页
    OutOfMemory,
    /// 缓冲区缓存中找不到可回收的块
    NoBuffers,
    /// 虚拟地址没有有效映射
    NotMapped,
    /// 映射存在但不是写时复制页
    NotCowPage,
    /// 地址未对齐或超出范围
    BadAddress,
    /// 描述符环的字节大小不是 128 的倍数
    RingSize,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfMemory => "out of physical pages",
            Self::NoBuffers => "no usable buffer",
            Self::NotMapped => "va not mapped",
            Self::NotCowPage => "pte is not a cow mapping",
            Self::BadAddress => "bad address",
            Self::RingSize => "descriptor ring size is not a multiple of 128 bytes",
        })
    }
}

impl error::Error for Error {}
