//! 网络帧缓冲区与接收通道

mod channel;
mod mbuf;

pub use channel::RxChannel;
pub use mbuf::MBuf;

/// 协议栈的接收入口。
///
/// 网卡驱动在中断上下文中对每个收到的帧调用一次，顺序与帧到达顺序一致。
/// 实现不能睡眠，也不能回调驱动。
pub trait NetRx: Sync {
    fn net_rx(&self, m: MBuf);
}
