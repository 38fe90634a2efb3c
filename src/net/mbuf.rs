//! 网络帧缓冲区
//!
//! 每个 [`MBuf`] 是一块 [`MBUF_SIZE`] 字节的内存，其中 `[head, head+len)` 是有效的帧数据。
//! 头部之前预留的空间（headroom）供协议栈逐层添加报头。
//!
//! `MBuf` 在任何时刻只有一个所有者：驱动的描述符环、协议栈或者已被释放，
//! 所有权随值移动，不需要引用计数。

use alloc::boxed::Box;
use core::fmt;

use crate::consts::net::MBUF_SIZE;

pub struct MBuf(Box<MBufInner>);

struct MBufInner {
    /// 有效数据在 `buf` 中的起始偏移
    head: usize,
    len: usize,
    buf: [u8; MBUF_SIZE],
}

impl MBuf {
    /// 分配一个空缓冲区，数据起点前预留 `headroom` 字节。
    pub fn alloc(headroom: usize) -> Self {
        if headroom > MBUF_SIZE {
            panic!("mbuf alloc: headroom {} too large", headroom);
        }
        Self(Box::new(MBufInner {
            head: headroom,
            len: 0,
            buf: [0; MBUF_SIZE],
        }))
    }

    /// 从头部剥去 `len` 字节，返回被剥去的部分；数据不足时返回 `None`。
    pub fn pull(&mut self, len: usize) -> Option<&mut [u8]> {
        let m = &mut *self.0;
        if len > m.len {
            return None;
        }
        let old = m.head;
        m.head += len;
        m.len -= len;
        Some(&mut m.buf[old..old + len])
    }

    /// 在头部前添加 `len` 字节并返回它们，预留空间不足时 panic。
    pub fn push(&mut self, len: usize) -> &mut [u8] {
        let m = &mut *self.0;
        if len > m.head {
            panic!("mbuf push: headroom {} < {}", m.head, len);
        }
        m.head -= len;
        m.len += len;
        let head = m.head;
        &mut m.buf[head..head + len]
    }

    /// 在尾部追加 `len` 字节并返回它们，空间不足时 panic。
    pub fn put(&mut self, len: usize) -> &mut [u8] {
        let m = &mut *self.0;
        let tail = m.head + m.len;
        if tail + len > MBUF_SIZE {
            panic!("mbuf put: no room for {} bytes", len);
        }
        m.len += len;
        &mut m.buf[tail..tail + len]
    }

    /// 从尾部剥去 `len` 字节，返回被剥去的部分；数据不足时返回 `None`。
    pub fn trim(&mut self, len: usize) -> Option<&mut [u8]> {
        let m = &mut *self.0;
        if len > m.len {
            return None;
        }
        m.len -= len;
        let tail = m.head + m.len;
        Some(&mut m.buf[tail..tail + len])
    }

    /// 网卡写入帧后由驱动设置数据长度
    pub(crate) fn set_len(&mut self, len: usize) {
        let m = &mut *self.0;
        if m.head + len > MBUF_SIZE {
            panic!("mbuf set_len: {} exceeds buffer", len);
        }
        m.len = len;
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// 头部之前剩余的预留空间
    pub fn headroom(&self) -> usize {
        self.0.head
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0.buf[self.0.head..self.0.head + self.0.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let m = &mut *self.0;
        &mut m.buf[m.head..m.head + m.len]
    }

    /// 有效数据起点的地址，写入 DMA 描述符。
    ///
    /// 缓冲区在堆上，`MBuf` 移动时地址不变。
    pub fn head_addr(&self) -> u64 {
        self.0.buf.as_ptr() as usize as u64 + self.0.head as u64
    }
}

impl fmt::Debug for MBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MBuf")
            .field("head", &self.0.head)
            .field("len", &self.0.len)
            .finish()
    }
}
