//! 内存管理模块：物理页分配、写时复制与 Sv39 页表

pub use addr::{pg_round_down, pg_round_up, Addr, PhysAddr, VirtAddr};
pub use kalloc::Kmem;
pub use pagetable::{PageTable, PageTableEntry, PteFlag};

mod addr;
pub mod kalloc;
mod pagetable;
