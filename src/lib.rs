//! xv6 内核的资源管理层：块缓冲区缓存、物理页分配与写时复制、E1000 网卡描述符环。
//!
//! 所有管理器都是显式构造的值，依赖的块设备、调度器、时钟计数与协议栈入口
//! 由调用者构造后以引用传入。内核在启动时构造它们一次，贯穿整个运行期；
//! 宿主机上的测试则可以构造任意多个互相独立的实例。

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

pub mod consts;
pub mod driver;
pub mod error;
pub mod fs;
pub mod mm;
pub mod net;
pub mod process;
pub mod sleeplock;
pub mod spinlock;
pub mod timer;

pub use error::{Error, Result};
