//! # link 模块说明
//!
//! ## 角色定位（Why）
//! - 定义运行端核心消费的连接协作方接口：一条支持单通道内按序投递的双向
//!   消息连接，以及按会话键控、带逐块确认的子连接；
//! - 具体实现由传输适配层提供（不在本仓库范围内），`weave-runner` 的测试
//!   替身亦实现同一契约。
//!
//! ## 契约说明（What）
//! - [`OrchestratorLink::send`]：按序投递一条连接级消息；
//! - [`OrchestratorLink::open_stream`]：发起大载荷发送会话，**在编排器返回
//!   携带会话标识的打开确认后**才解析；
//! - [`StreamSender::chunk`]：逐块锁步——仅当接收端确认该块后返回，发送方
//!   因此天然只有一个在途分块；
//! - [`StreamReceiver::advance`]：消费侧唯一的上行确认点，每块恰好一次，
//!   与扇出分支数无关。
//!
//! ## 风险提示（Trade-offs）
//! - 契约不含超时：确认悬置会让对应调用无限等待，连接级超时属于连接建立
//!   协作方；
//! - 实现必须保证 `send` 的按通道有序性，否则 Writer 的 FIFO 回执匹配会
//!   静默错位。

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::LinkError;
use crate::message::{FromRunner, SessionId, StreamHeader};

/// 与编排器之间唯一 RPC 连接的发送半部。
#[async_trait]
pub trait OrchestratorLink: Send + Sync + 'static {
    /// 向编排器投递一条连接级消息。
    async fn send(&self, event: FromRunner) -> Result<(), LinkError>;

    /// 打开一个大载荷发送会话，等待编排器的打开确认后返回发送端。
    async fn open_stream(&self, header: StreamHeader) -> Result<Box<dyn StreamSender>, LinkError>;

    /// 绑定一个已被通告的入站流会话的接收端。
    async fn accept_stream(&self, session: SessionId) -> Result<Box<dyn StreamReceiver>, LinkError>;
}

/// 大载荷发送会话：逐块锁步发送。
#[async_trait]
pub trait StreamSender: Send {
    /// 编排器为该会话分配的标识。
    fn session(&self) -> SessionId;

    /// 发送一块载荷，直到接收端确认该块才返回。
    async fn chunk(&mut self, chunk: Bytes) -> Result<(), LinkError>;

    /// 发出会话结束标记。
    async fn finish(&mut self) -> Result<(), LinkError>;
}

/// 大载荷接收会话：按序收块，逐块上行确认。
#[async_trait]
pub trait StreamReceiver: Send {
    /// 接收下一块载荷；`None` 表示会话正常结束。
    async fn recv(&mut self) -> Result<Option<Bytes>, LinkError>;

    /// 对刚收到的一块发出上行确认，准许发送方继续。
    async fn advance(&mut self) -> Result<(), LinkError>;
}
