//! # reader 模块说明
//!
//! ## 角色定位（Why）
//! - 一条通道的入站端点：持有零或多个消费者槽位，把每帧数据与每个入站
//!   流会话分发给**全部**槽位，并在所有槽位接受条目之后才向编排器回执
//!   `Processed`——这就是入站背压：上一条未被全员消费完，编排器不会投递
//!   下一条。
//!
//! ## 行为契约（What）
//! - `strings()`/`buffers()`/`streams()`/`payloads()` 各注册一个绑定对应
//!   转换器的新槽位并返回其消费者视图；
//! - [`handle_frame`](Reader::handle_frame)：同步按注册顺序推入全部槽位
//!   （保持线缆顺序），再以后台任务等待接受屏障并回执；零槽位立即回执；
//! - [`handle_stream`](Reader::handle_stream)：绑定会话接收端，经 fanout
//!   把分块序列一次读取、多路分发；全部分支条目被接受后回执通道级
//!   `Processed`；零槽位时仍逐块上行确认并回执——生产者永不因无人消费而
//!   停摆；
//! - [`close`](Reader::close)：向每个槽位投递关闭哨兵；关闭不是被确认的
//!   数据项，不产生 `Processed`。
//!
//! ## 风险提示（Trade-offs）
//! - 槽位注册发生在处理器装配期；数据到达后才注册的消费者看不到此前的
//!   条目，这是契约而非缺陷；
//! - 回执发送失败只记录日志：连接已断时整个运行端都在收尾，Reader 无需
//!   再做补救。

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use weave_core::convertor::{
    BytesConvertor, ChunkStream, Convertor, Payload, PayloadConvertor, StreamConvertor,
    TextConvertor,
};
use weave_core::link::OrchestratorLink;
use weave_core::message::{Ack, ChannelId, DataFrame, FromRunner, SequenceNumber, StreamOpen};

use crate::consumer::{self, Consumer, SharedSlot};
use crate::fanout::{self, Fanout};

/// 接受信号的等待端。
type AcceptWaiter = oneshot::Receiver<()>;

/// 类型擦除的消费者槽位：Reader 对所有载荷视图走同一条分发路径。
trait InboundSlot: Send + Sync {
    /// 转换并推入一帧；返回该槽位的接受信号。
    fn push_frame(&self, payload: Bytes) -> AcceptWaiter;

    /// 消费一条扇出分支并推入结果；返回的 future 在槽位接受条目后完成。
    fn push_stream(self: Arc<Self>, chunks: ChunkStream) -> BoxFuture<'static, ()>;

    /// 投递关闭哨兵。
    fn close(&self);
}

/// 绑定具体转换器的槽位实现。
struct TypedSlot<C: Convertor> {
    convertor: C,
    shared: SharedSlot<C::Output>,
}

impl<C: Convertor> InboundSlot for TypedSlot<C> {
    fn push_frame(&self, payload: Bytes) -> AcceptWaiter {
        let (accept_tx, accept_rx) = oneshot::channel();
        let item = self.convertor.from_frame(payload);
        consumer::push(&self.shared, Ok(item), accept_tx);
        accept_rx
    }

    fn push_stream(self: Arc<Self>, chunks: ChunkStream) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            // 收集型转换器在此消费整条分支；透传转换器立即返回分支本身。
            let item = self.convertor.from_stream(chunks).await;
            let (accept_tx, accept_rx) = oneshot::channel();
            consumer::push(&self.shared, item, accept_tx);
            let _ = accept_rx.await;
        })
    }

    fn close(&self) {
        consumer::close(&self.shared);
    }
}

struct ReaderInner {
    channel: ChannelId,
    link: Arc<dyn OrchestratorLink>,
    slots: Mutex<Vec<Arc<dyn InboundSlot>>>,
}

impl ReaderInner {
    async fn send_processed(&self, sequence: SequenceNumber) {
        let ack = FromRunner::Processed(Ack {
            channel: self.channel.clone(),
            sequence,
        });
        if let Err(error) = self.link.send(ack).await {
            tracing::error!(channel = %self.channel, %sequence, %error, "failed to report a processed item");
        }
    }
}

/// 通道入站端点的可克隆句柄。
#[derive(Clone)]
pub struct Reader {
    inner: Arc<ReaderInner>,
}

impl Reader {
    pub(crate) fn new(channel: ChannelId, link: Arc<dyn OrchestratorLink>) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                channel,
                link,
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 该端点服务的通道。
    pub fn channel(&self) -> &ChannelId {
        &self.inner.channel
    }

    fn register<C: Convertor>(&self, convertor: C) -> Consumer<C::Output> {
        let shared = consumer::shared_slot();
        let slot = Arc::new(TypedSlot {
            convertor,
            shared: Arc::clone(&shared),
        });
        self.inner.slots.lock().push(slot);
        Consumer::new(shared)
    }

    /// 注册一个文本消费者视图。
    pub fn strings(&self) -> Consumer<String> {
        self.register(TextConvertor)
    }

    /// 注册一个原始字节消费者视图。
    pub fn buffers(&self) -> Consumer<Bytes> {
        self.register(BytesConvertor)
    }

    /// 注册一个流式消费者视图（逐块处理，不聚合）。
    pub fn streams(&self) -> Consumer<ChunkStream> {
        self.register(StreamConvertor)
    }

    /// 注册一个动态载荷消费者视图。
    pub fn payloads(&self) -> Consumer<Payload> {
        self.register(PayloadConvertor)
    }

    /// 分发一帧入站数据。
    pub(crate) fn handle_frame(&self, frame: DataFrame) {
        tracing::debug!(channel = %self.inner.channel, sequence = %frame.sequence, bytes = frame.payload.len(), "handling a data frame");
        let waiters: Vec<AcceptWaiter> = self
            .inner
            .slots
            .lock()
            .iter()
            .map(|slot| slot.push_frame(frame.payload.clone()))
            .collect();
        let inner = Arc::clone(&self.inner);
        let sequence = frame.sequence;
        tokio::spawn(async move {
            for waiter in waiters {
                // 发送端被丢弃等价于接受：消费者已分离。
                let _ = waiter.await;
            }
            inner.send_processed(sequence).await;
        });
    }

    /// 分发一个入站流会话。
    pub(crate) fn handle_stream(&self, open: StreamOpen) {
        tracing::debug!(channel = %self.inner.channel, sequence = %open.sequence, session = %open.session, "handling a stream session");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let receiver = match inner.link.accept_stream(open.session).await {
                Ok(receiver) => receiver,
                Err(error) => {
                    tracing::error!(channel = %inner.channel, session = %open.session, %error, "failed to bind a stream session");
                    return;
                }
            };
            let slots: Vec<Arc<dyn InboundSlot>> = inner.slots.lock().clone();
            let (hub, evictions) = Fanout::new(open.session, slots.len());
            // 泵独立于完成屏障运行：透传分支可在回执之后继续排空。
            tokio::spawn(fanout::pump(Arc::clone(&hub), receiver, evictions));

            let branches = slots
                .into_iter()
                .enumerate()
                .map(|(index, slot)| slot.push_stream(hub.branch(index)));
            futures::future::join_all(branches).await;
            inner.send_processed(open.sequence).await;
        });
    }

    /// 关闭全部消费者视图。
    pub(crate) fn close(&self) {
        tracing::debug!(channel = %self.inner.channel, "closing the reader");
        for slot in self.inner.slots.lock().iter() {
            slot.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemoryOrchestrator;
    use weave_core::message::SessionId;

    fn frame(channel: &ChannelId, sequence: u64, payload: &'static [u8]) -> DataFrame {
        DataFrame {
            channel: channel.clone(),
            sequence: SequenceNumber::new(sequence),
            payload: Bytes::from_static(payload),
        }
    }

    fn has_processed(events: &[FromRunner], sequence: u64) -> bool {
        events.iter().any(|event| {
            matches!(event, FromRunner::Processed(ack) if ack.sequence.value() == sequence)
        })
    }

    #[tokio::test]
    async fn frame_for_zero_consumers_is_acknowledged() {
        let orchestrator = MemoryOrchestrator::new();
        let channel = ChannelId::new("idle");
        let reader = Reader::new(channel.clone(), orchestrator.link());

        reader.handle_frame(frame(&channel, 1, b"nobody"));
        orchestrator
            .wait_for(|events| has_processed(events, 1))
            .await;
    }

    #[tokio::test]
    async fn every_consumer_sees_the_same_ordered_sequence() {
        let orchestrator = MemoryOrchestrator::new();
        let channel = ChannelId::new("fanout");
        let reader = Reader::new(channel.clone(), orchestrator.link());

        let mut strings = reader.strings();
        let mut buffers = reader.buffers();

        reader.handle_frame(frame(&channel, 1, b"Hello"));
        reader.handle_frame(frame(&channel, 2, b"world"));
        reader.close();

        let mut seen_strings = Vec::new();
        while let Some(item) = strings.next().await {
            seen_strings.push(item.unwrap());
        }
        assert_eq!(seen_strings, vec!["Hello", "world"]);

        let mut seen_buffers = Vec::new();
        while let Some(item) = buffers.next().await {
            seen_buffers.push(item.unwrap());
        }
        assert_eq!(
            seen_buffers,
            vec![Bytes::from_static(b"Hello"), Bytes::from_static(b"world")]
        );
    }

    #[tokio::test]
    async fn late_consumer_never_sees_earlier_items() {
        let orchestrator = MemoryOrchestrator::new();
        let channel = ChannelId::new("late");
        let reader = Reader::new(channel.clone(), orchestrator.link());

        let mut early = reader.strings();
        reader.handle_frame(frame(&channel, 1, b"first"));
        assert_eq!(early.next().await.unwrap().unwrap(), "first");

        let mut late = reader.strings();
        reader.handle_frame(frame(&channel, 2, b"second"));
        reader.close();

        assert_eq!(early.next().await.unwrap().unwrap(), "second");
        assert_eq!(
            late.next().await.unwrap().unwrap(),
            "second",
            "晚注册的消费者只应看到注册之后的条目"
        );
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn processed_waits_for_the_slowest_consumer() {
        let orchestrator = MemoryOrchestrator::new();
        let channel = ChannelId::new("gated");
        let reader = Reader::new(channel.clone(), orchestrator.link());

        let mut prompt = reader.strings();
        let mut sluggish = reader.strings();

        reader.handle_frame(frame(&channel, 1, b"item"));
        // 快消费者越过条目：再次拉取即触发其接受信号。
        assert_eq!(prompt.next().await.unwrap().unwrap(), "item");
        let prompt_task = tokio::spawn(async move { prompt.next().await });

        tokio::task::yield_now().await;
        assert!(
            !has_processed(&orchestrator.events(), 1),
            "慢消费者尚未接受，不得回执"
        );

        assert_eq!(sluggish.next().await.unwrap().unwrap(), "item");
        drop(sluggish); // 丢弃触发在手条目的接受信号。
        orchestrator
            .wait_for(|events| has_processed(events, 1))
            .await;

        reader.close();
        assert!(prompt_task.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_session_fans_out_to_collecting_consumers() {
        let orchestrator = MemoryOrchestrator::new();
        let channel = ChannelId::new("streams");
        let reader = Reader::new(channel.clone(), orchestrator.link());

        let mut strings = reader.strings();
        let mut buffers = reader.buffers();
        let mut more_strings = reader.strings();

        let (mut sender, session) = orchestrator.open_loose_stream().await;
        reader.handle_stream(StreamOpen {
            channel: channel.clone(),
            sequence: SequenceNumber::new(1),
            session,
        });

        let feeder = tokio::spawn(async move {
            sender.chunk(Bytes::from_static(b"Hello")).await.unwrap();
            sender.chunk(Bytes::from_static(b"World")).await.unwrap();
            sender.finish().await.unwrap();
        });

        assert_eq!(strings.next().await.unwrap().unwrap(), "HelloWorld");
        assert_eq!(
            buffers.next().await.unwrap().unwrap(),
            Bytes::from_static(b"HelloWorld")
        );
        assert_eq!(more_strings.next().await.unwrap().unwrap(), "HelloWorld");
        feeder.await.unwrap();

        // 三个消费者、两块载荷：上行确认仍恰好两次。
        orchestrator
            .wait_for(|events| has_processed(events, 1))
            .await;
        assert_eq!(orchestrator.session_advances(session), 2);
    }

    #[tokio::test]
    async fn stream_session_with_no_consumers_still_acknowledges() {
        let orchestrator = MemoryOrchestrator::new();
        let channel = ChannelId::new("drain");
        let reader = Reader::new(channel.clone(), orchestrator.link());

        let (mut sender, session) = orchestrator.open_loose_stream().await;
        reader.handle_stream(StreamOpen {
            channel: channel.clone(),
            sequence: SequenceNumber::new(1),
            session,
        });

        sender.chunk(Bytes::from_static(b"a")).await.unwrap();
        sender.chunk(Bytes::from_static(b"b")).await.unwrap();
        sender.finish().await.unwrap();

        orchestrator
            .wait_for(|events| has_processed(events, 1))
            .await;
        assert_eq!(orchestrator.session_advances(session), 2);
    }
}
