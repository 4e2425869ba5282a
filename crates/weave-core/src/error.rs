//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 划分运行端核心的两个错误域：连接/会话层（[`LinkError`]）与通道层
//!   （[`ChannelError`]），保证调用方能按域决定重试或放弃；
//! - 协议失步（无人等待的回执、指向未知通道的消息）**不在此建模**：编排器
//!   是独立进程，可能行为异常，运行端必须存活以服务其余通道，因此失步仅
//!   以 `tracing::error!` 记录后忽略，绝不让其成为可传播的失败。
//!
//! ## 设计要求（What）
//! - 错误类型实现 `thiserror::Error`，`Send + Sync + 'static`，可跨任务传播；
//! - 单个消费者或单次发送的失败不得波及同通道的其他消费者，更不得波及
//!   其他通道——传播范围由调用方（Reader/Writer）裁剪，错误类型自身保持
//!   纯数据；
//! - 本层没有重试：重试若存在，属于连接建立协作方。

use thiserror::Error;

use crate::message::{ChannelId, SessionId};

/// 连接与流会话子连接的传输层错误。
///
/// # 教案式说明
/// - **意图 (Why)**：把“与编排器的物理连接不可用”与“某次会话被拒绝”区分
///   开，前者通常意味着整个运行端进入收尾，后者只影响一次发送；
/// - **契约 (What)**：所有变体可克隆，便于向多个扇出分支重复投递同一失败；
/// - **风险 (Trade-offs)**：`detail` 使用 `String` 牺牲少量分配换取排障
///   可读性。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// 与编排器的连接已关闭，后续发送与会话均不可能成功。
    #[error("connection to the orchestrator is closed")]
    ConnectionClosed,

    /// 流会话打开请求被编排器拒绝。
    #[error("stream session was rejected by the orchestrator: {detail}")]
    SessionRejected {
        /// 编排器给出的拒绝原因。
        detail: String,
    },

    /// 其余传输故障（连接中断、子连接损坏等）。
    #[error("transport failure: {detail}")]
    Transport {
        /// 底层传输给出的描述。
        detail: String,
    },
}

/// 通道端点操作对处理器代码暴露的错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// 底层连接或子连接失败。
    #[error(transparent)]
    Link(#[from] LinkError),

    /// 流会话中途失败，所有扇出分支以同一错误终止迭代。
    #[error("stream session {session} aborted mid-flight: {detail}")]
    SessionAborted {
        /// 出错的会话。
        session: SessionId,
        /// 失败原因。
        detail: String,
    },

    /// 通道已关闭，关闭之后发起的发送被拒绝。
    #[error("channel {channel} is closed")]
    ChannelClosed {
        /// 被关闭的通道。
        channel: ChannelId,
    },
}
