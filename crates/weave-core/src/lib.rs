#![deny(unsafe_code)]
#![doc = r#"
# weave-core

## 设计动机（Why）
- **定位**：weave 是管线执行协议的运行端（Runner）实现。一个进程承载若干
  数据变换单元（Processor），由外部编排器将它们连成数据流图；所有数据都
  经由与编排器之间唯一的双向 RPC 连接转发，运行端负责把这条连接复用成
  多条互相独立的逻辑通道。
- **架构角色**：本 crate 是契约层，沉淀与具体运行时无关的内容——协议消息
  模型、连接协作方接口、载荷转换器与处理器生命周期契约。真正的通道端点
  （Reader/Writer/Runner 调度器）位于 `weave-runner`。
- **设计理念**：连接、图解析、处理器加载均以 trait 形式出现，运行端核心只
  依赖契约而非具体实现，便于测试替身与未来的传输适配层各自演进。

## 核心契约（What）
- [`message`]：按方向划分的连接级消息和（通道、序列号、会话）标识；
- [`link`]：`OrchestratorLink` 与大载荷流会话的收发接口；
- [`convertor`]：帧载荷 / 分块序列到 `String`/`Bytes`/透传流的纯转换；
- [`processor`]：`init` / `transform` / `produce` 三段式生命周期；
- [`error`]：连接层与通道层的错误域划分。

## 风险与考量（Trade-offs）
- 契约层刻意不含任何互斥或队列结构，顺序与背压不变量由 `weave-runner`
  维护；若绕过 Runner 直接驱动 link，确认回执的 FIFO 匹配无从保证。
- 消息模型以 `bytes::Bytes` 承载载荷，跨消费者扇出依赖其引用计数克隆；
  替换为自有缓冲类型时需重新评估零拷贝假设。
"#]

pub use async_trait::async_trait;

pub mod convertor;
pub mod error;
pub mod link;
pub mod message;
pub mod processor;

pub mod prelude {
    //! 常用契约的一次性导入面，供处理器与测试代码使用。
    pub use crate::convertor::{
        BytesConvertor, ChunkStream, Convertor, Payload, PayloadConvertor, StreamConvertor,
        TextConvertor,
    };
    pub use crate::error::{ChannelError, LinkError};
    pub use crate::link::{OrchestratorLink, StreamReceiver, StreamSender};
    pub use crate::message::{
        Ack, ChannelId, DataFrame, FromRunner, ProcessorSpec, RunnerId, SequenceNumber, SessionId,
        StreamHeader, StreamOpen, ToRunner,
    };
    pub use crate::processor::Processor;
}
