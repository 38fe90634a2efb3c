//! 文件系统模块，目前只包含块缓冲区缓存层

mod bio;

pub use bio::{Bcache, Buf, BufData, BufPin, NODEV};
