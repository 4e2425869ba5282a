#![deny(unsafe_code)]
#![doc = r#"
# weave-runner

## 设计动机（Why）
- **定位**：管线执行协议运行端的 Tokio 实现层。`weave-core` 定义契约，
  本 crate 把与编排器之间唯一的 RPC 连接复用成多条逻辑通道：每条通道
  一个入站端点（[`Reader`]）与一个出站端点（[`Writer`]），由
  [`Runner`] 调度器统一装配与派发。
- **背压模型**：两个方向各自闭环——入站侧，一条数据要等通道上**全部**
  消费者接受后才回执 `Processed`，编排器据此投递下一条；出站侧，每次
  发送挂起到对端的 `Processed` 回执到达，回执按严格 FIFO 匹配在途发送。
- **大载荷**：超出单帧的数据走流会话子连接，逐块锁步传输；入站侧经
  扇出枢纽一次读取、多路分发，每块恰好一次上行确认，与消费者数量无关。

## 模块地图（What）
- [`consumer`]：单个消费者视图的队列状态机与接受信号时序；
- `fanout`（crate 内部）：流会话的共享缓冲扇出与驱逐门控的上行确认；
- [`reader`] / [`writer`]：通道端点；
- [`runner`]：端点注册表、处理器生命周期与调度循环；
- [`testkit`]：进程内编排器替身，单元与集成测试共用。

## 风险与考量（Trade-offs）
- 端点句柄廉价克隆（内部 `Arc`），但每通道的顺序不变量依赖“每通道至多
  各一个端点”——绕过 [`Runner`] 注册表自建端点即自担失序风险；
- 契约不含超时：编排器悬置回执会让对应发送无限等待，连接级超时属于
  传输适配层。
"#]

pub mod consumer;
mod fanout;
pub mod reader;
pub mod runner;
pub mod testkit;
pub mod writer;

pub use consumer::Consumer;
pub use reader::Reader;
pub use runner::{GraphResolver, Runner};
pub use writer::Writer;

pub use weave_core::prelude;
