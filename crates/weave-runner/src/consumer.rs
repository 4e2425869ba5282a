//! # consumer 模块说明
//!
//! ## 角色定位（Why）
//! - 每次调用 Reader 的 `strings()`/`buffers()`/`streams()`/`payloads()`
//!   都会注册一个独立消费者视图；本模块实现其底层状态机：一段临界区内
//!   同时守护“待处理条目 FIFO 队列”与“唯一的停靠等待者”；
//! - 原实现依赖生成器的协作式挂起（条目在迭代方越过 `yield` 后才算被
//!   接受），这里以显式队列加 `Waker` 重建同一时序。
//!
//! ## 行为契约（What）
//! - 推入条目时：若有等待者停靠则立即唤醒，否则入队——两者必须在同一
//!   临界区内判定；
//! - 恰好一个关闭哨兵终止序列；关闭后的推入是记录日志的空操作，且立即
//!   回执接受信号，避免卡住通道背压；
//! - 条目 N 的接受信号在消费方请求条目 N+1（或消费者被丢弃）时触发，
//!   复现“越过 yield 才算消费完成”的确认时机；
//! - 消费者中途丢弃会分离该视图：排队条目全部立即回执，后续推入直接
//!   回执——被放弃的迭代不得让通道停摆。
//!
//! ## 并发模型（How）
//! - 单把 `parking_lot::Mutex` 守护队列与 `Waker` 槽；`next()` 持有
//!   `&mut self`，天然保证至多一个等待者；
//! - 接受信号用 `tokio::sync::oneshot` 承载，发送端即便先于接收端就绪，
//!   信号也不会丢失。

use std::collections::VecDeque;
use std::sync::Arc;
use std::task::{Poll, Waker};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use weave_core::error::ChannelError;

/// 队列条目：载荷或关闭哨兵。
enum Entry<T> {
    /// 一个已转换的条目及其接受信号发送端。
    Item(Result<T, ChannelError>, oneshot::Sender<()>),
    /// 关闭哨兵，序列到此为止。
    Close,
}

/// 消费者与推入方共享的状态。
pub(crate) struct Shared<T> {
    queue: VecDeque<Entry<T>>,
    waker: Option<Waker>,
    /// 已收到关闭哨兵，后续推入为空操作。
    closed: bool,
    /// 消费者已被丢弃，所有条目立即回执。
    detached: bool,
}

impl<T> Shared<T> {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

pub(crate) type SharedSlot<T> = Arc<Mutex<Shared<T>>>;

/// 新建一个空的共享槽位。
pub(crate) fn shared_slot<T>() -> SharedSlot<T> {
    Arc::new(Mutex::new(Shared {
        queue: VecDeque::new(),
        waker: None,
        closed: false,
        detached: false,
    }))
}

/// 向槽位推入一个条目；`accept` 在消费方越过该条目后触发。
pub(crate) fn push<T>(slot: &SharedSlot<T>, item: Result<T, ChannelError>, accept: oneshot::Sender<()>) {
    let mut shared = slot.lock();
    if shared.closed || shared.detached {
        // 关闭后的推入按契约容忍：立即回执，不得卡住 Reader 的完成屏障。
        tracing::debug!("discarding an item pushed after the consumer closed");
        let _ = accept.send(());
        return;
    }
    shared.queue.push_back(Entry::Item(item, accept));
    shared.wake();
}

/// 投递关闭哨兵；重复关闭为空操作。
pub(crate) fn close<T>(slot: &SharedSlot<T>) {
    let mut shared = slot.lock();
    if shared.closed {
        return;
    }
    shared.closed = true;
    shared.queue.push_back(Entry::Close);
    shared.wake();
}

/// Reader 入站条目的独立消费者视图。
///
/// # 教案式注释
/// - **意图 (Why)**：向处理器代码呈现“逐条拉取直至关闭”的最小抽象，
///   背压细节（接受信号、FIFO 回执）全部藏在状态机内；
/// - **契约 (What)**：
///   - [`next`](Consumer::next) 返回 `Some(item)` 或在关闭哨兵处返回
///     `None`；无条目时挂起，不阻塞其他消费者；
///   - 注册晚于某条目到达的消费者永远看不到该条目；
///   - 丢弃消费者安全：通道其余部分继续运转；
/// - **风险 (Trade-offs)**：`next` 取 `&mut self`，同一消费者不可并发
///   拉取；需要共享时应注册多个消费者视图。
pub struct Consumer<T> {
    shared: SharedSlot<T>,
    /// 上一个条目的接受信号，在下一次 `next`（或丢弃）时触发。
    pending_accept: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl<T> Consumer<T> {
    pub(crate) fn new(shared: SharedSlot<T>) -> Self {
        Self {
            shared,
            pending_accept: None,
            finished: false,
        }
    }

    /// 拉取下一个条目；序列结束后恒返回 `None`。
    pub async fn next(&mut self) -> Option<Result<T, ChannelError>> {
        if self.finished {
            return None;
        }
        // 请求下一条即宣告上一条已被消费完毕。
        if let Some(accept) = self.pending_accept.take() {
            let _ = accept.send(());
        }
        let entry = futures::future::poll_fn(|cx| {
            let mut shared = self.shared.lock();
            match shared.queue.pop_front() {
                Some(entry) => Poll::Ready(entry),
                None => {
                    shared.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await;
        match entry {
            Entry::Item(item, accept) => {
                self.pending_accept = Some(accept);
                Some(item)
            }
            Entry::Close => {
                self.finished = true;
                None
            }
        }
    }

    /// 以 `futures::Stream` 形状消费该视图。
    pub fn into_stream(self) -> impl Stream<Item = Result<T, ChannelError>> + Send
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut consumer| async move {
            consumer.next().await.map(|item| (item, consumer))
        })
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        if let Some(accept) = self.pending_accept.take() {
            let _ = accept.send(());
        }
        let mut shared = self.shared.lock();
        shared.detached = true;
        while let Some(entry) = shared.queue.pop_front() {
            if let Entry::Item(_, accept) = entry {
                let _ = accept.send(());
            }
        }
    }
}
