//! # convertor 模块说明
//!
//! ## 角色定位（Why）
//! - Reader 的每个消费者视图绑定一个转换器：同一帧或同一流会话按转换器
//!   各自解出 `String`、`Bytes`、透传分块流或带判别标记的 [`Payload`]；
//! - 转换器是无状态纯函数集合，不做任何 IO，也不感知通道或会话。
//!
//! ## 设计要求（What）
//! - `from_frame` 同步、纯；`from_stream` 消费整个分块序列后返回，唯一的
//!   例外是透传转换器——它以常数时间把序列原样交出，供流式消费者逐块
//!   处理；
//! - 文本解码采用替换字符策略（与原实现默认文本解码器一致），因此帧解码
//!   不会失败；`from_stream` 的错误只来自底层会话。

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};

use crate::error::ChannelError;

/// 大载荷流会话在消费侧的统一形状：有序分块序列，出错即终止。
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChannelError>> + Send + 'static>>;

/// 载荷转换器契约。
///
/// # 教案式注释
/// - **意图 (Why)**：Reader 对所有消费者公用一次线缆读取，类型差异全部
///   收敛到转换器，新增载荷视图无需触碰通道逻辑；
/// - **契约 (What)**：
///   - `from_frame`：纯同步，把一帧字节解为 `Output`；
///   - `from_stream`：异步消费整个分块序列；除透传实现外，返回前必须
///     读到序列终点；
/// - **风险 (Trade-offs)**：收集型实现会把整个会话载荷聚入内存，真正的
///   无界载荷应选用透传视图。
#[async_trait]
pub trait Convertor: Send + Sync + 'static {
    /// 转换结果类型。
    type Output: Send + 'static;

    /// 把单帧载荷解为输出值。
    fn from_frame(&self, payload: Bytes) -> Self::Output;

    /// 消费分块序列并解为输出值。
    async fn from_stream(&self, chunks: ChunkStream) -> Result<Self::Output, ChannelError>;
}

/// 顺序收集分块序列为一段连续字节。
async fn collect_chunks(mut chunks: ChunkStream) -> Result<Vec<u8>, ChannelError> {
    let mut collected = Vec::new();
    while let Some(chunk) = chunks.next().await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected)
}

/// 文本视图：UTF-8 解码，非法字节替换为 U+FFFD。
#[derive(Clone, Copy, Debug, Default)]
pub struct TextConvertor;

#[async_trait]
impl Convertor for TextConvertor {
    type Output = String;

    fn from_frame(&self, payload: Bytes) -> String {
        String::from_utf8_lossy(&payload).into_owned()
    }

    async fn from_stream(&self, chunks: ChunkStream) -> Result<String, ChannelError> {
        let collected = collect_chunks(chunks).await?;
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }
}

/// 原始字节视图：帧原样交出，流会话按序拼接。
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesConvertor;

#[async_trait]
impl Convertor for BytesConvertor {
    type Output = Bytes;

    fn from_frame(&self, payload: Bytes) -> Bytes {
        payload
    }

    async fn from_stream(&self, chunks: ChunkStream) -> Result<Bytes, ChannelError> {
        let collected = collect_chunks(chunks).await?;
        Ok(Bytes::from(collected))
    }
}

/// 流式视图：帧升格为单块序列，流会话以常数时间透传。
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamConvertor;

#[async_trait]
impl Convertor for StreamConvertor {
    type Output = ChunkStream;

    fn from_frame(&self, payload: Bytes) -> ChunkStream {
        Box::pin(stream::once(std::future::ready(Ok(payload))))
    }

    async fn from_stream(&self, chunks: ChunkStream) -> Result<ChunkStream, ChannelError> {
        Ok(chunks)
    }
}

/// 发送方动态决定表示形式时使用的带判别标记载荷。
///
/// - **契约 (What)**：`Text`/`Bytes` 为有界值；`Stream` 保留流式性质，经
///   Writer 回写时仍以流会话发送；
/// - **风险 (Trade-offs)**：`Stream` 变体持有惰性序列，既不可克隆也不可
///   比较，`Debug` 输出只报告变体名。
pub enum Payload {
    /// 文本载荷。
    Text(String),
    /// 字节载荷。
    Bytes(Bytes),
    /// 流式载荷。
    Stream(ChunkStream),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Payload::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// 动态载荷视图：帧进入 `Bytes` 变体，流会话进入 `Stream` 变体（透传）。
#[derive(Clone, Copy, Debug, Default)]
pub struct PayloadConvertor;

#[async_trait]
impl Convertor for PayloadConvertor {
    type Output = Payload;

    fn from_frame(&self, payload: Bytes) -> Payload {
        Payload::Bytes(payload)
    }

    async fn from_stream(&self, chunks: ChunkStream) -> Result<Payload, ChannelError> {
        Ok(Payload::Stream(chunks))
    }
}
