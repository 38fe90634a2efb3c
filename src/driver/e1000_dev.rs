//! E1000 硬件定义
//!
//! 寄存器偏移、描述符布局与控制位，取自 Intel 8254x 开发者手册。
//! 寄存器常量以 32 位字为单位，可直接作为寄存器数组下标。

/// 设备控制
pub const CTL: usize = 0x0000 / 4;
/// 中断原因读出，写入任意值以确认
pub const ICR: usize = 0x00C0 / 4;
/// 中断屏蔽设置
pub const IMS: usize = 0x00D0 / 4;
/// 接收控制
pub const RCTL: usize = 0x0100 / 4;
/// 发送控制
pub const TCTL: usize = 0x0400 / 4;
/// 发送帧间隔
pub const TIPG: usize = 0x0410 / 4;
pub const RDBAL: usize = 0x2800 / 4;
pub const RDBAH: usize = 0x2804 / 4;
pub const RDLEN: usize = 0x2808 / 4;
pub const RDH: usize = 0x2810 / 4;
pub const RDT: usize = 0x2818 / 4;
/// 接收中断延迟
pub const RDTR: usize = 0x2820 / 4;
/// 接收中断绝对延迟
pub const RADV: usize = 0x282C / 4;
pub const TDBAL: usize = 0x3800 / 4;
pub const TDBAH: usize = 0x3804 / 4;
pub const TDLEN: usize = 0x3808 / 4;
pub const TDH: usize = 0x3810 / 4;
pub const TDT: usize = 0x3818 / 4;
/// 组播表，共 4096 位
pub const MTA: usize = 0x5200 / 4;
pub const MTA_LEN: usize = 4096 / 32;
/// 接收地址过滤，低字为 MAC 前 4 字节，高字为后 2 字节与有效位
pub const RA: usize = 0x5400 / 4;

/// 寄存器空间至少要覆盖到的字数
pub const REGS_LEN: usize = RA + 2;

/// CTL：全局复位
pub const CTL_RST_BIT: usize = 26;
/// IMS：接收描述符写回中断
pub const IMS_RXDW_BIT: usize = 7;
/// RA 高字：地址有效
pub const RA_AV_BIT: usize = 31;

/// TCTL 中冲突阈值字段
pub const TCTL_CT: core::ops::Range<usize> = 4..12;
/// TCTL 中冲突距离字段
pub const TCTL_COLD: core::ops::Range<usize> = 12..22;

/// RCTL 中缓冲区大小字段取 0 表示 2048 字节
pub const RCTL_SZ_2048: u32 = 0;

bitflags! {
    /// 发送控制位
    pub struct Tctl: u32 {
        /// 使能
        const EN = 1 << 1;
        /// 填充过短的帧
        const PSP = 1 << 3;
    }
}

bitflags! {
    /// 接收控制位
    pub struct Rctl: u32 {
        /// 使能
        const EN = 1 << 1;
        /// 接收广播
        const BAM = 1 << 15;
        /// 去掉以太网 CRC
        const SECRC = 1 << 26;
    }
}

bitflags! {
    /// 发送描述符命令位
    pub struct TxdCmd: u8 {
        /// 帧结束
        const EOP = 1 << 0;
        /// 完成后回报状态
        const RS = 1 << 3;
    }
}

bitflags! {
    /// 发送描述符状态位
    pub struct TxdStat: u8 {
        /// 描述符已处理完毕
        const DD = 1 << 0;
    }
}

bitflags! {
    /// 接收描述符状态位
    pub struct RxdStat: u8 {
        /// 描述符已写回
        const DD = 1 << 0;
        /// 帧结束
        const EOP = 1 << 1;
    }
}

/// 传统发送描述符，16 字节
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct TxDesc {
    pub addr: u64,
    pub length: u16,
    pub cso: u8,
    pub cmd: u8,
    pub status: u8,
    pub css: u8,
    pub special: u16,
}

impl TxDesc {
    pub const EMPTY: Self = Self {
        addr: 0,
        length: 0,
        cso: 0,
        cmd: 0,
        status: 0,
        css: 0,
        special: 0,
    };
}

/// 接收描述符，16 字节
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct RxDesc {
    pub addr: u64,
    pub length: u16,
    pub csum: u16,
    pub status: u8,
    pub errors: u8,
    pub special: u16,
}

impl RxDesc {
    pub const EMPTY: Self = Self {
        addr: 0,
        length: 0,
        csum: 0,
        status: 0,
        errors: 0,
        special: 0,
    };
}
