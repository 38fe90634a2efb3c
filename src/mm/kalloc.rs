//! 物理页分配器与写时复制
//!
//! 以 4096 字节为单位管理一段物理内存，服务于用户进程、页表以外的内核页和管道缓冲区。
//! 空闲页链表与引用计数表是同一批资源的两个视图：
//! 页在空闲链表上当且仅当它的引用计数为 0，
//! 被页表映射的页的引用计数等于指向它的映射个数。
//!
//! 两把锁同时需要时，总是先取空闲链表锁 `kmem`，再取引用计数锁 `kcow`。

use alloc::vec;
use alloc::vec::Vec;
use core::ptr;

use log::{debug, trace};

use crate::consts::{ALLOC_JUNK, FREE_JUNK, MAXVA, PGSIZE};
use crate::error::{Error, Result};
use crate::spinlock::SpinLock;
use super::addr::{pg_round_down, pg_round_up};
use super::{Addr, PageTable, PhysAddr, PteFlag, VirtAddr};

/// 空闲链表的结尾
const NIL: usize = usize::MAX;

/// 物理页分配器。
///
/// 在系统启动时用 [`Kmem::new`] 接管 `[start, end)` 内的全部整页，之后贯穿系统生命周期。
pub struct Kmem {
    /// 空闲页链表
    freelist: SpinLock<FreeList>,
    /// 每个物理页的引用计数，防止多个 CPU 同时修改同一物理页的引用数
    refcnt: SpinLock<Vec<u32>>,
    /// 第一个可分配页的地址
    base: usize,
    /// 最后一个可分配页之后的地址
    end: usize,
}

/// 以页号为下标的单向链表，`next[i]` 是页 `i` 之后的空闲页。
///
/// 链接信息放在独立的数组里而不是空闲页内部，释放时填充的垃圾字节不会破坏链表。
struct FreeList {
    head: usize,
    next: Vec<usize>,
    len: usize,
}

impl FreeList {
    fn new(nframes: usize) -> Self {
        Self {
            head: NIL,
            next: vec![NIL; nframes],
            len: 0,
        }
    }

    fn push(&mut self, frame: usize) {
        self.next[frame] = self.head;
        self.head = frame;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let frame = self.head;
        self.head = self.next[frame];
        self.next[frame] = NIL;
        self.len -= 1;
        Some(frame)
    }
}

impl Kmem {
    /// 接管 `[start, end)` 中所有完整的物理页。
    ///
    /// # 功能说明
    /// 起始地址向上、结束地址向下按页对齐。每一页先把引用计数置为 1，
    /// 再经 [`Kmem::kfree`] 释放一次，从而以计数 0、填满释放垃圾字节的状态进入空闲链表。
    ///
    /// # 安全性
    /// 调用者保证该区间是可读写的、不被其他任何代码使用的内存，
    /// 并且在返回的 `Kmem` 存活期间一直有效。
    pub unsafe fn new(start: usize, end: usize) -> Self {
        let base = pg_round_up(start);
        let end = pg_round_down(end);
        let nframes = if end > base { (end - base) / PGSIZE } else { 0 };

        let kmem = Self {
            freelist: SpinLock::new(FreeList::new(nframes), "kmem"),
            refcnt: SpinLock::new(vec![1; nframes], "kcow"),
            base,
            end: base + nframes * PGSIZE,
        };
        for frame in 0..nframes {
            kmem.kfree(PhysAddr::from_raw(base + frame * PGSIZE));
        }

        #[cfg(feature = "verbose_init_info")]
        log::info!(
            "kmem: {} pages available in [{:#x}, {:#x})",
            nframes,
            kmem.base,
            kmem.end
        );

        kmem
    }

    /// 分配一页物理内存。
    ///
    /// 页的引用计数置为 1，内容填满 [`ALLOC_JUNK`]。没有空闲页时立即返回
    /// [`Error::OutOfMemory`]，从不等待。
    pub fn kalloc(&self) -> Result<PhysAddr> {
        let mut freelist = self.freelist.lock();
        let frame = match freelist.pop() {
            Some(frame) => frame,
            None => {
                trace!("kalloc: out of pages");
                return Err(Error::OutOfMemory);
            }
        };
        self.refcnt.lock()[frame] = 1;
        drop(freelist);

        let pa = self.frame_addr(frame);
        unsafe { ptr::write_bytes(pa as *mut u8, ALLOC_JUNK, PGSIZE) };
        Ok(unsafe { PhysAddr::from_raw(pa) })
    }

    /// 归还物理页的一个引用。
    ///
    /// 计数降到 0 时，页内容填满 [`FREE_JUNK`] 并回到空闲链表；
    /// 计数仍为正时页继续被其他映射共享，除减一外什么也不做。
    ///
    /// 地址未对齐、不在管理范围内或页已经空闲，都是调用者的逻辑错误，直接 panic。
    pub fn kfree(&self, pa: PhysAddr) {
        let frame = self.frame_index(pa, "kfree");

        let mut refcnt = self.refcnt.lock();
        match refcnt[frame] {
            0 => panic!("kfree: page {:#x} is already free", pa.as_usize()),
            1 => refcnt[frame] = 0,
            _ => {
                refcnt[frame] -= 1;
                return;
            }
        }
        drop(refcnt);

        unsafe { ptr::write_bytes(pa.as_usize() as *mut u8, FREE_JUNK, PGSIZE) };
        self.freelist.lock().push(frame);
    }

    /// 为新的映射增加一个引用，用于 fork 时共享物理页
    pub fn share(&self, pa: PhysAddr) {
        let frame = self.frame_index(pa, "share");
        let mut refcnt = self.refcnt.lock();
        if refcnt[frame] == 0 {
            panic!("share: page {:#x} is free", pa.as_usize());
        }
        refcnt[frame] += 1;
    }

    /// 物理页当前的引用计数
    pub fn refcount(&self, pa: PhysAddr) -> usize {
        let frame = self.frame_index(pa, "refcount");
        self.refcnt.lock()[frame] as usize
    }

    /// 空闲页个数
    pub fn free_pages(&self) -> usize {
        self.freelist.lock().len
    }

    /// 管理的总页数
    pub fn total_pages(&self) -> usize {
        (self.end - self.base) / PGSIZE
    }

    /// 判断 `va` 是否经由一个有效的写时复制页表项映射。
    ///
    /// 缺页处理程序用它区分写时复制缺页与真正的权限错误。
    pub fn is_cow_page(&self, pgt: &PageTable, va: usize) -> bool {
        if va >= MAXVA {
            return false;
        }
        match pgt.walk(unsafe { VirtAddr::from_raw(va) }) {
            Some(pte) => pte.is_valid() && pte.is_cow(),
            None => false,
        }
    }

    /// 处理 `va` 上的写时复制缺页，返回该页此后映射到的物理地址。
    ///
    /// # 流程解释
    /// 1. 取 `va` 所在页的页表项，必须有效且带有 COW 标记；
    /// 2. 引用计数为 1 时页已不再共享，原地改为可写并清除 COW 标记；
    /// 3. 否则分配新页、复制共享页内容、把页表项改指向新页（可写、无 COW），
    ///    再归还旧页的一个引用。
    ///
    /// # 可能的错误
    /// - [`Error::BadAddress`]：`va` 超出用户地址空间；
    /// - [`Error::NotMapped`] / [`Error::NotCowPage`]：不是写时复制映射；
    /// - [`Error::OutOfMemory`]：没有空闲页，此时原映射保持不变。
    pub fn resolve_cow_fault(&self, pgt: &mut PageTable, va: usize) -> Result<PhysAddr> {
        if va >= MAXVA {
            return Err(Error::BadAddress);
        }
        let va = unsafe { VirtAddr::from_raw(pg_round_down(va)) };
        let pte = match pgt.walk_mut(va) {
            Some(pte) if pte.is_valid() => pte,
            _ => return Err(Error::NotMapped),
        };
        if !pte.is_cow() {
            return Err(Error::NotCowPage);
        }

        let pa = pte.as_phys_addr();
        let mut perm = pte.read_perm();
        perm.insert(PteFlag::W);
        perm.remove(PteFlag::COW);

        if self.refcount(pa) == 1 {
            pte.write_perm(pa, perm);
            return Ok(pa);
        }

        let mem = self.kalloc()?;
        unsafe { ptr::copy_nonoverlapping(pa.as_ptr(), mem.as_usize() as *mut u8, PGSIZE) };
        pte.write_perm(mem, perm);
        self.kfree(pa);
        debug!(
            "cow: va {:#x} copied {:#x} -> {:#x}",
            va.as_usize(),
            pa.as_usize(),
            mem.as_usize()
        );
        Ok(mem)
    }

    /// 物理地址对应的页号，`who` 为出错时 panic 信息中的调用者名
    fn frame_index(&self, pa: PhysAddr, who: &str) -> usize {
        let addr = pa.as_usize();
        if addr % PGSIZE != 0 || addr < self.base || addr >= self.end {
            panic!("{}: bad page {:#x}", who, addr);
        }
        (addr - self.base) / PGSIZE
    }

    #[inline]
    fn frame_addr(&self, frame: usize) -> usize {
        self.base + frame * PGSIZE
    }
}
