//! 页表配置与管理
//!
//! Sv39 三级页表。写时复制标记放在页表项的 RSW 位（第 8 位）上，
//! 硬件忽略这些位，缺页处理程序据此区分写时复制缺页与真正的权限错误。

use alloc::alloc::{alloc_zeroed, Layout};
use alloc::boxed::Box;
use core::convert::TryFrom;

use crate::consts::{PGSHIFT, PGSIZE, SV39FLAGLEN};
use crate::error::{Error, Result};
use super::{Addr, Kmem, PhysAddr, VirtAddr};

bitflags! {
    /// 页表项标志位
    pub struct PteFlag: usize {
        /// 有效
        const V = 1 << 0;
        /// 可读
        const R = 1 << 1;
        /// 可写
        const W = 1 << 2;
        /// 可执行
        const X = 1 << 3;
        /// 用户态可访问
        const U = 1 << 4;
        /// 全局映射
        const G = 1 << 5;
        /// 已访问
        const A = 1 << 6;
        /// 已写入
        const D = 1 << 7;
        /// 写时复制：只读共享，写入时需要复制出私有页
        const COW = 1 << 8;
    }
}

/// 页表项，低 10 位为标志，其上为物理页号。
#[repr(C)]
#[derive(Debug)]
pub struct PageTableEntry {
    data: usize,
}

impl PageTableEntry {
    const EMPTY: Self = Self { data: 0 };

    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.data & (PteFlag::V.bits())) > 0
    }

    /// 叶子项至少带有 R/W/X 之一，否则指向下一级页表
    #[inline]
    fn is_leaf(&self) -> bool {
        let flag_bits = self.data & (PteFlag::R | PteFlag::W | PteFlag::X).bits();
        flag_bits != 0
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        (self.data & (PteFlag::U.bits())) > 0
    }

    #[inline]
    pub fn is_cow(&self) -> bool {
        (self.data & (PteFlag::COW.bits())) > 0
    }

    #[inline]
    fn as_page_table(&self) -> *mut PageTable {
        ((self.data >> SV39FLAGLEN) << PGSHIFT) as *mut PageTable
    }

    #[inline]
    pub fn as_phys_addr(&self) -> PhysAddr {
        unsafe { PhysAddr::from_raw((self.data >> SV39FLAGLEN) << PGSHIFT) }
    }

    #[inline]
    fn write_zero(&mut self) {
        self.data = 0;
    }

    #[inline]
    fn write(&mut self, pa: PhysAddr) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (PteFlag::V.bits());
    }

    /// 把页表项改写为映射到 `pa`、权限为 `perm`（自动加上 V）
    #[inline]
    pub fn write_perm(&mut self, pa: PhysAddr, perm: PteFlag) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (perm | PteFlag::V).bits()
    }

    #[inline]
    pub fn read_perm(&self) -> PteFlag {
        PteFlag::from_bits_truncate(self.data)
    }
}

/// 一页大小的页表，512 个页表项。
///
/// 页表页本身由内核堆分配（`Box`），它们映射的用户页才来自 [`Kmem`]。
#[repr(C, align(4096))]
pub struct PageTable {
    data: [PageTableEntry; 512],
}

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            data: [PageTableEntry::EMPTY; 512],
        }
    }

    /// 在堆上分配一个空的根页表
    pub fn new() -> Box<Self> {
        Box::new(Self::empty())
    }

    /// 分配一个下级页表页，堆耗尽时返回 `None`。
    ///
    /// 全零的页表项即空项，因此清零的内存就是合法的空页表，
    /// 之后可以交给 `Box::from_raw` 释放。
    fn try_alloc() -> Option<*mut PageTable> {
        let pgt = unsafe { alloc_zeroed(Layout::new::<PageTable>()) } as *mut PageTable;
        if pgt.is_null() {
            None
        } else {
            Some(pgt)
        }
    }

    /// 释放 `level` 级页表之下的所有下级页表，并清空本表。
    ///
    /// 只有第 2、1 级的非叶子项指向页表页；第 0 级的项无论权限如何都是叶子，
    /// 它们映射的物理页归 [`Kmem`] 管理，这里不碰，调用者应先用
    /// [`PageTable::uvm_unmap`] 归还。
    fn free_walk(&mut self, level: usize) {
        for pte in self.data.iter_mut() {
            if level > 0 && pte.is_valid() && !pte.is_leaf() {
                let mut child = unsafe { Box::from_raw(pte.as_page_table()) };
                child.free_walk(level - 1);
            }
            pte.write_zero();
        }
    }

    /// 为 `[va, va+size)` 建立到 `[pa, pa+size)` 的映射。
    ///
    /// `va` 与 `size` 不必页对齐，覆盖到的每一页都会被映射。
    /// `perm` 不含 R/W/X 之一、或目标页表项已经有效，都属于调用者的逻辑错误，直接 panic。
    pub fn map_pages(
        &mut self,
        mut va: VirtAddr,
        size: usize,
        mut pa: PhysAddr,
        perm: PteFlag,
    ) -> Result<()> {
        if !perm.intersects(PteFlag::R | PteFlag::W | PteFlag::X) {
            panic!("map_pages: perm {:?}", perm);
        }
        let mut last = VirtAddr::try_from(va.as_usize() + size)?;
        va.pg_round_down();
        last.pg_round_up();

        while va != last {
            match self.walk_alloc(va) {
                Some(pte) => {
                    if pte.is_valid() {
                        panic!(
                            "remap: va {:#x} pa {:#x} pte {:#x}",
                            va.as_usize(),
                            pa.as_usize(),
                            pte.data
                        );
                    }
                    pte.write_perm(pa, perm);
                    va.add_page();
                    pa.add_page();
                }
                None => return Err(Error::OutOfMemory),
            }
        }

        Ok(())
    }

    fn walk_alloc(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut (*pgt).data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                pgt = Self::try_alloc()?;
                pte.write(unsafe { PhysAddr::from_raw(pgt as usize) });
            }
        }
        unsafe { Some(&mut (*pgt).data[va.page_num(0)]) }
    }

    /// 查找 `va` 对应的叶子页表项，中间页表缺失时返回 `None`
    pub fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut (*pgt).data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None;
            }
        }
        unsafe { Some(&mut (*pgt).data[va.page_num(0)]) }
    }

    pub fn walk(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        let mut pgt = self as *const PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &(*pgt).data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None;
            }
        }
        unsafe { Some(&(*pgt).data[va.page_num(0)]) }
    }

    /// 查找 `va` 所在页映射到的物理地址
    pub fn walk_addr(&self, va: VirtAddr) -> Result<PhysAddr> {
        match self.walk(va) {
            Some(pte) if pte.is_valid() => Ok(pte.as_phys_addr()),
            _ => Err(Error::NotMapped),
        }
    }

    /// 解除从 `va` 开始的 `count` 页映射。
    ///
    /// 给出 `kmem` 时，同时通过 [`Kmem::kfree`] 归还每一页的一个引用。
    pub fn uvm_unmap(&mut self, va: usize, count: usize, freeing: Option<&Kmem>) {
        if va % PGSIZE != 0 {
            panic!("uvm_unmap: va not page aligned");
        }

        for ca in (va..(va + PGSIZE * count)).step_by(PGSIZE) {
            let pte = match self.walk_mut(unsafe { VirtAddr::from_raw(ca) }) {
                Some(pte) => pte,
                None => panic!("uvm_unmap: va {:#x} has no page table", ca),
            };
            if !pte.is_valid() {
                panic!("uvm_unmap: va {:#x} not mapped", ca);
            }
            if !pte.is_leaf() {
                panic!("uvm_unmap: va {:#x} not a leaf", ca);
            }
            if let Some(kmem) = freeing {
                kmem.kfree(pte.as_phys_addr());
            }
            pte.write_zero();
        }
    }

    /// fork 时以写时复制方式共享 `[0, size)`。
    ///
    /// 可写页在父子两侧都改为只读并打上 [`PteFlag::COW`]，只读页原样共享；
    /// 每建立一个子映射，物理页引用计数加一。中途失败时撤销子页表中已建立的映射。
    pub fn uvm_copy_cow(&mut self, child: &mut Self, size: usize, kmem: &Kmem) -> Result<()> {
        for i in (0..size).step_by(PGSIZE) {
            let va = unsafe { VirtAddr::from_raw(i) };
            let pte = match self.walk_mut(va) {
                Some(pte) if pte.is_valid() => pte,
                _ => panic!("uvm_copy_cow: va {:#x} not present", i),
            };
            let pa = pte.as_phys_addr();
            let mut perm = pte.read_perm();
            if perm.contains(PteFlag::W) {
                perm.remove(PteFlag::W);
                perm.insert(PteFlag::COW);
                pte.write_perm(pa, perm);
            }

            if let Err(e) = child.map_pages(va, PGSIZE, pa, perm) {
                child.uvm_unmap(0, i / PGSIZE, Some(kmem));
                return Err(e);
            }
            kmem.share(pa);
        }
        Ok(())
    }
}

impl Drop for PageTable {
    /// 递归释放所有下级页表页。
    ///
    /// 下级页表在 `free_walk` 中已被清空，它们自己的 `drop` 什么也不做。
    fn drop(&mut self) {
        self.free_walk(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(raw: usize) -> VirtAddr {
        VirtAddr::try_from(raw).unwrap()
    }

    #[test]
    fn map_then_walk() {
        let mut pgt = PageTable::new();
        let pa = PhysAddr::try_from(0x8020_0000).unwrap();
        pgt.map_pages(va(0x1000), PGSIZE * 2, pa, PteFlag::R | PteFlag::U).unwrap();

        assert_eq!(pgt.walk_addr(va(0x1000)).unwrap().into_raw(), 0x8020_0000);
        assert_eq!(pgt.walk_addr(va(0x2fff)).unwrap().into_raw(), 0x8020_1000);
        assert_eq!(pgt.walk_addr(va(0x3000)), Err(Error::NotMapped));

        let pte = pgt.walk(va(0x1000)).unwrap();
        assert!(pte.is_user());
        assert!(!pte.is_cow());
        assert_eq!(pte.read_perm(), PteFlag::V | PteFlag::R | PteFlag::U);

        pgt.uvm_unmap(0x1000, 2, None);
        assert_eq!(pgt.walk_addr(va(0x1000)), Err(Error::NotMapped));
    }

    #[test]
    fn unmapped_region_has_no_table() {
        let pgt = PageTable::new();
        assert!(pgt.walk(va(0x4000_0000)).is_none());
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_panics() {
        let mut pgt = PageTable::new();
        let pa = PhysAddr::try_from(0x8020_0000).unwrap();
        pgt.map_pages(va(0), PGSIZE, pa, PteFlag::R).unwrap();
        let _ = pgt.map_pages(va(0), PGSIZE, pa, PteFlag::R);
    }

    #[test]
    #[should_panic(expected = "map_pages: perm")]
    fn mapping_without_access_bits_panics() {
        let mut pgt = PageTable::new();
        let pa = PhysAddr::try_from(0x8020_0000).unwrap();
        let _ = pgt.map_pages(va(0), PGSIZE, pa, PteFlag::U);
    }

    #[test]
    fn drop_never_frees_last_level_entries() {
        let mut pgt = PageTable::new();
        let pa = PhysAddr::try_from(0x8020_0000).unwrap();
        pgt.map_pages(va(0), PGSIZE, pa, PteFlag::R | PteFlag::U).unwrap();
        pgt.map_pages(va(1 << 30), PGSIZE, pa, PteFlag::W).unwrap();

        // 叶子项去掉 R/W/X 后看起来像指向下级页表，释放时仍不能当作页表页
        let pte = pgt.walk_mut(va(0)).unwrap();
        pte.write_perm(pa, PteFlag::U);
        assert!(!pte.is_leaf());
        drop(pgt);
    }
}
