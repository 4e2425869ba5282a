//! # message 模块说明
//!
//! ## 角色定位（Why）
//! - 定义运行端与编排器之间连接级消息的精确形状，以及通道 / 序列号 / 会话
//!   三类标识；
//! - 原始协议以“字段是否填充”充当消息判别标记，这里改以穷尽枚举表达，
//!   调度器必须逐变体匹配，漏配即编译错误。
//!
//! ## 设计要求（What）
//! - 每条消息只承载一种语义：一个变体对应一种消息类型；
//! - 序列号按（通道、方向）单调递增，基值为 1，仅用于确认回执的关联，不做
//!   重排序——底层连接保证单通道内按序投递；
//! - 所有标识类型可廉价克隆（`Arc<str>` / `Copy`），可以放心在注册表键与
//!   日志字段之间传递。

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 逻辑数据通道的不透明名称。
///
/// # 教案式注释
/// - **意图 (Why)**：一条通道在运行端进程内至多各有一个 Reader 与一个
///   Writer，注册表、消息路由与日志均以该名称为键；
/// - **契约 (What)**：内部为 `Arc<str>`，克隆为引用计数递增；相等与哈希
///   基于字符串内容；
/// - **风险 (Trade-offs)**：不对内容做任何校验，是否为 URI 由图描述层决定。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    /// 由任意字符串构造通道标识。
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// 以 `&str` 视图读取通道名称。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// 运行端进程自身的标识，随 `Identify` 与流会话打开请求上报编排器。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunnerId(Arc<str>);

impl RunnerId {
    /// 由任意字符串构造运行端标识。
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// 以 `&str` 视图读取标识。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunnerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 按（通道、方向）单调递增的发送序列号。
///
/// - **契约 (What)**：基值为 1，每次发送（帧或流会话打开）递增 1，发送失败
///   也不回收；仅用于 `Processed` 回执的关联；
/// - **风险 (Trade-offs)**：回执匹配采用严格 FIFO 而非按号查找，序列号本身
///   只是诊断与协议字段，调度器不得据其重排。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// 序列号基值。
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    /// 由原始整数构造序列号。
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// 读取原始整数。
    pub const fn value(self) -> u64 {
        self.0
    }

    /// 返回紧随其后的序列号。
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 大载荷流会话的标识，由编排器在会话打开时分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// 由原始整数构造会话标识。
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// 读取原始整数。
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 单个有界载荷帧：一条通道上的一次数据投递。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    /// 目标或来源通道。
    pub channel: ChannelId,
    /// 发送方分配的序列号。
    pub sequence: SequenceNumber,
    /// 载荷字节。
    pub payload: Bytes,
}

/// 入站流会话通告：随后将有一串分块经由 `session` 对应的子连接到达。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOpen {
    /// 目标通道。
    pub channel: ChannelId,
    /// 该会话在通道上的序列号，语义与帧序列号一致。
    pub sequence: SequenceNumber,
    /// 子连接的会话标识。
    pub session: SessionId,
}

/// 处理完成回执：`channel` 上序列号为 `sequence` 的数据已被对端完整消费。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// 数据所在通道。
    pub channel: ChannelId,
    /// 被确认的发送序列号。
    pub sequence: SequenceNumber,
}

/// 出站流会话的打开请求头，编排器据此分配 [`SessionId`]。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    /// 数据所在通道。
    pub channel: ChannelId,
    /// 会话占用的发送序列号。
    pub sequence: SequenceNumber,
    /// 发起方运行端标识。
    pub runner: RunnerId,
}

/// 处理器装配说明：图解析协作方据此构造处理器实例。
///
/// `config` 为不透明配置串（原始协议中为 JSON），其解释完全交由图解析
/// 协作方，核心不读取内容。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    /// 处理器在图描述中的标识。
    pub uri: String,
    /// 不透明配置串。
    pub config: String,
}

/// 编排器发往运行端的连接级消息。
///
/// # 教案式注释
/// - **意图 (Why)**：调度器对入站消息做穷尽匹配，新增消息类型时编译器会
///   强制补全分支；
/// - **契约 (What)**：每条消息恰好一种语义；`Pipeline` 的图描述对核心不
///   透明，由图解析协作方消化；
/// - **风险 (Trade-offs)**：携带 `Bytes` 的变体未派生序列化能力，线缆编码
///   属于传输适配层（不在本仓库范围内）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToRunner {
    /// 投递一帧数据给某通道的 Reader。
    Frame(DataFrame),
    /// 通告一条通道即将收到大载荷流会话。
    StreamOpen(StreamOpen),
    /// 关闭一条通道（Reader、Writer 或两者）。
    Close {
        /// 被关闭的通道。
        channel: ChannelId,
    },
    /// 运行端此前某次发送的处理完成回执。
    Processed(Ack),
    /// 不透明的管线图描述，交由图解析协作方处理。
    Pipeline {
        /// 序列化的图描述。
        description: String,
    },
    /// 指示运行端装配一个处理器。
    Processor(ProcessorSpec),
    /// 所有处理器开始 `produce`。
    Start,
}

/// 运行端发往编排器的连接级消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FromRunner {
    /// 连接建立后的首条消息，自报运行端标识。
    Identify {
        /// 运行端标识。
        runner: RunnerId,
    },
    /// 某通道 Writer 发出的一帧数据。
    Frame(DataFrame),
    /// 入站数据已被本端全部消费者消费完毕的回执。
    Processed(Ack),
    /// 本端主动关闭一条通道。
    Close {
        /// 被关闭的通道。
        channel: ChannelId,
    },
    /// 某处理器完成 `init`。
    Initialized {
        /// 处理器标识。
        processor: String,
    },
}
