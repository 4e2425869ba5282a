//! # writer 模块说明
//!
//! ## 角色定位（Why）
//! - 一条通道的出站端点：发送帧或发起大载荷流会话，并把调用方挂起到编排
//!   器的处理完成回执到达为止——发送方的背压与接收侧的消费屏障在此闭环。
//!
//! ## 行为契约（What）
//! - 序列号按通道单调递增（基值 1），帧与流会话打开同等计数，发送失败也
//!   不回收；
//! - 回执按**严格 FIFO** 匹配在途发送：先发先解，不按序列号查找——底层
//!   连接保证回执按发送顺序返回，调度器乱序调用 [`handled`](Writer::handled)
//!   即协议失步；
//! - 无人等待时的 [`handled`](Writer::handled) 是协议失步缺陷：响亮记录
//!   错误日志后忽略，绝不崩溃；
//! - 流发送逐块锁步：每块等接收侧确认后才产出下一块，在途分块至多一个，
//!   内存占用有界，接收端扇出因此只面对单一流控点；
//! - [`close`](Writer::close) 在尚有流发送在途时推迟：调用方停靠在关闭
//!   等待队列，最后一个流完成后才真正发出关闭帧并放行全部等待者——通道
//!   绝不在大载荷传输中途被关闭；
//! - 关闭之后发起的发送以 `ChannelError::ChannelClosed` 拒绝，重复关闭
//!   则是空操作。
//!
//! ## 并发模型（How）
//! - 单把 `parking_lot::Mutex` 守护序列号、在途回执队列、开放流计数与
//!   关闭等待队列；所有异步等待（连接发送、回执、逐块确认）都发生在该
//!   临界区之外；
//! - 另一把 `tokio::sync::Mutex` 串联“登记回执等待者 + 提交连接”两步：
//!   端点句柄可克隆到多个任务并发发送，若提交不串联，登记顺序与线缆
//!   顺序可能错位，FIFO 回执匹配随之失配。提交失败的发送当场撤销其
//!   等待者——未上线缆的发送不会有回执。

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use weave_core::convertor::Payload;
use weave_core::error::ChannelError;
use weave_core::link::{OrchestratorLink, StreamSender};
use weave_core::message::{ChannelId, DataFrame, FromRunner, RunnerId, SequenceNumber, StreamHeader};

struct WriterState {
    next_sequence: SequenceNumber,
    /// 下一个等待者登记号；仅用于失败提交的定点撤销。
    next_waiter: u64,
    /// 在途发送的回执等待队列；长度恒等于已上线缆、未确认的发送数。
    pending_acks: VecDeque<(u64, oneshot::Sender<()>)>,
    /// 在途流发送数；非零时关闭被推迟。
    open_streams: usize,
    /// 推迟的关闭调用方。
    close_waiters: Vec<oneshot::Sender<()>>,
    /// 关闭帧已发出，重复关闭为空操作。
    closed: bool,
}

struct WriterInner {
    channel: ChannelId,
    runner: RunnerId,
    link: Arc<dyn OrchestratorLink>,
    /// 提交锁：持锁完成“登记等待者 + 提交连接”，队列顺序恒等于线缆顺序。
    submit: tokio::sync::Mutex<()>,
    state: Mutex<WriterState>,
}

impl WriterInner {
    /// 分配序列号并登记回执等待者；两者必须在同一临界区内完成，
    /// 以保证回执队列顺序与发送顺序一致。关闭之后的发送被拒绝。
    ///
    /// 调用方必须已持有 `submit` 锁，并在提交连接失败时以返回的登记号
    /// 调用 [`discard_waiter`](Self::discard_waiter)。
    fn enqueue_send(
        &self,
        open_stream: bool,
    ) -> Result<(SequenceNumber, u64, oneshot::Receiver<()>), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::ChannelClosed {
                channel: self.channel.clone(),
            });
        }
        if open_stream {
            state.open_streams += 1;
        }
        let sequence = state.next_sequence;
        state.next_sequence = sequence.next();
        let waiter = state.next_waiter;
        state.next_waiter += 1;
        let (ack_tx, ack_rx) = oneshot::channel();
        state.pending_acks.push_back((waiter, ack_tx));
        Ok((sequence, waiter, ack_rx))
    }

    /// 撤销一个失败提交的回执等待者：未上线缆（或会话中途夭折）的发送
    /// 不会再有回执，残留条目会错位后续的 FIFO 匹配。
    fn discard_waiter(&self, waiter: u64) {
        let mut state = self.state.lock();
        if let Some(index) = state.pending_acks.iter().position(|(id, _)| *id == waiter) {
            state.pending_acks.remove(index);
        }
    }

    /// 真正执行关闭：按需发出关闭帧，随后放行全部等待者。
    async fn close_now(&self, issued_remotely: bool) -> Result<(), ChannelError> {
        let should_send = {
            let mut state = self.state.lock();
            let first_close = !state.closed;
            state.closed = true;
            first_close && !issued_remotely
        };
        let result = if should_send {
            tracing::debug!(channel = %self.channel, "closing the channel");
            self.link
                .send(FromRunner::Close {
                    channel: self.channel.clone(),
                })
                .await
                .map_err(ChannelError::from)
        } else {
            Ok(())
        };
        // 关闭帧发出之后才放行等待者：它们的 close() 不得先于关闭帧返回。
        let waiters = std::mem::take(&mut self.state.lock().close_waiters);
        for waiter in waiters {
            let _ = waiter.send(());
        }
        result
    }

    /// 一次流发送收尾：递减计数，必要时执行被推迟的关闭。
    async fn finish_stream(&self) {
        let perform_deferred_close = {
            let mut state = self.state.lock();
            state.open_streams -= 1;
            state.open_streams == 0 && !state.close_waiters.is_empty()
        };
        if perform_deferred_close
            && let Err(error) = self.close_now(false).await
        {
            tracing::error!(channel = %self.channel, %error, "deferred close failed");
        }
    }
}

/// 通道出站端点的可克隆句柄。
#[derive(Clone)]
pub struct Writer {
    inner: Arc<WriterInner>,
}

impl Writer {
    pub(crate) fn new(channel: ChannelId, runner: RunnerId, link: Arc<dyn OrchestratorLink>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                channel,
                runner,
                link,
                submit: tokio::sync::Mutex::new(()),
                state: Mutex::new(WriterState {
                    next_sequence: SequenceNumber::FIRST,
                    next_waiter: 0,
                    pending_acks: VecDeque::new(),
                    open_streams: 0,
                    close_waiters: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// 该端点服务的通道。
    pub fn channel(&self) -> &ChannelId {
        &self.inner.channel
    }

    /// 编码并发送一段文本，挂起直到处理完成回执到达。
    pub async fn string(&self, text: &str) -> Result<(), ChannelError> {
        tracing::debug!(channel = %self.inner.channel, chars = text.len(), "sending a string");
        self.send_frame(Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    /// 发送一段字节，挂起直到处理完成回执到达。
    pub async fn buffer(&self, payload: Bytes) -> Result<(), ChannelError> {
        tracing::debug!(channel = %self.inner.channel, bytes = payload.len(), "sending a buffer");
        self.send_frame(payload).await
    }

    /// 按判别标记分派动态载荷。
    pub async fn payload(&self, payload: Payload) -> Result<(), ChannelError> {
        match payload {
            Payload::Text(text) => self.string(&text).await,
            Payload::Bytes(bytes) => self.buffer(bytes).await,
            Payload::Stream(chunks) => self.send_stream(chunks).await,
        }
    }

    /// 以流会话发送一个分块序列，逐块锁步。
    pub async fn stream<S>(&self, source: S) -> Result<(), ChannelError>
    where
        S: Stream<Item = Bytes> + Send,
    {
        self.send_stream(source.map(Ok)).await
    }

    /// 携带变换函数的流发送：逐项映射为字节后锁步发出。
    pub async fn stream_map<S, T, F>(&self, source: S, mut transform: F) -> Result<(), ChannelError>
    where
        S: Stream<Item = T> + Send,
        T: Send,
        F: FnMut(T) -> Bytes + Send,
    {
        self.send_stream(source.map(move |item| Ok(transform(item))))
            .await
    }

    async fn send_frame(&self, payload: Bytes) -> Result<(), ChannelError> {
        // 回执等待者必须先于发送登记，且登记与提交在提交锁内原子完成：
        // 并发发送方各自先登记后提交会让队列顺序与线缆顺序错位。
        let handled = {
            let _submit = self.inner.submit.lock().await;
            let (sequence, waiter, handled) = self.inner.enqueue_send(false)?;
            let submitted = self
                .inner
                .link
                .send(FromRunner::Frame(DataFrame {
                    channel: self.inner.channel.clone(),
                    sequence,
                    payload,
                }))
                .await;
            if let Err(error) = submitted {
                self.inner.discard_waiter(waiter);
                return Err(error.into());
            }
            handled
        };
        // 发送端不会在未发送信号的情况下消失于正常路径；失步场景下挂起
        // 属于契约（无超时）。
        let _ = handled.await;
        Ok(())
    }

    async fn send_stream<S>(&self, source: S) -> Result<(), ChannelError>
    where
        S: Stream<Item = Result<Bytes, ChannelError>> + Send,
    {
        // 会话打开即提交：头帧须与并发的帧发送保持线缆顺序，逐块传输
        // 则走会话自己的子连接，不占提交锁。
        let (sender, waiter, handled) = {
            let submit = self.inner.submit.lock().await;
            let (sequence, waiter, handled) = self.inner.enqueue_send(true)?;
            let header = StreamHeader {
                channel: self.inner.channel.clone(),
                sequence,
                runner: self.inner.runner.clone(),
            };
            match self.inner.link.open_stream(header).await {
                Ok(sender) => {
                    tracing::debug!(channel = %self.inner.channel, %sequence, session = %sender.session(), "streaming a large payload");
                    (sender, waiter, handled)
                }
                Err(error) => {
                    self.inner.discard_waiter(waiter);
                    drop(submit);
                    self.inner.finish_stream().await;
                    return Err(error.into());
                }
            }
        };

        let result = self.run_stream(sender, source).await;
        match &result {
            // 会话整体的通道级处理完成回执。
            Ok(()) => {
                let _ = handled.await;
            }
            // 中途夭折的会话不再有回执。
            Err(_) => self.inner.discard_waiter(waiter),
        }
        self.inner.finish_stream().await;
        result
    }

    async fn run_stream<S>(
        &self,
        mut sender: Box<dyn StreamSender>,
        source: S,
    ) -> Result<(), ChannelError>
    where
        S: Stream<Item = Result<Bytes, ChannelError>> + Send,
    {
        futures::pin_mut!(source);
        while let Some(chunk) = source.next().await {
            // 逐块锁步：`chunk` 在接收侧确认后才返回。
            sender.chunk(chunk?).await?;
        }
        sender.finish().await?;
        Ok(())
    }

    /// 优雅关闭通道；存在在途流发送时推迟到全部完成。
    pub async fn close(&self) -> Result<(), ChannelError> {
        self.close_with_origin(false).await
    }

    /// 执行远端发起的关闭：同样尊重在途流，但不回发关闭帧。
    pub(crate) async fn close_on_remote_request(&self) -> Result<(), ChannelError> {
        self.close_with_origin(true).await
    }

    async fn close_with_origin(&self, issued_remotely: bool) -> Result<(), ChannelError> {
        let deferred = {
            let mut state = self.inner.state.lock();
            if state.open_streams != 0 {
                let (close_tx, close_rx) = oneshot::channel();
                state.close_waiters.push(close_tx);
                Some(close_rx)
            } else {
                None
            }
        };
        match deferred {
            Some(close_rx) => {
                tracing::debug!(channel = %self.inner.channel, "close deferred until open streams finish");
                let _ = close_rx.await;
                Ok(())
            }
            None => self.inner.close_now(issued_remotely).await,
        }
    }

    /// 处理完成回执到达：按 FIFO 解除最旧的在途发送。
    ///
    /// 无人等待即协议失步——记录错误后忽略，保持运行端存活。
    pub fn handled(&self) {
        let waiter = self.inner.state.lock().pending_acks.pop_front();
        match waiter {
            Some((_, ack_tx)) => {
                let _ = ack_tx.send(());
            }
            None => {
                tracing::error!(
                    channel = %self.inner.channel,
                    "received a processed-acknowledgment with no pending send; orchestrator and runner are out of sync"
                );
            }
        }
    }
}
