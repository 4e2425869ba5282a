//! # testkit 模块说明
//!
//! ## 角色定位（Why）
//! - 提供一个进程内的编排器替身：实现 [`OrchestratorLink`] 全部契约，把
//!   运行端发出的消息记录为可断言的事件序列，并可按路由表把出站消息回灌
//!   成入站消息——无需真实网络即可搭建端到端管线；
//! - 单元测试与集成测试共用同一替身，协议行为只在一处建模。
//!
//! ## 行为契约（What）
//! - [`MemoryOrchestrator::link`] 返回的连接把每条 [`FromRunner`] 追加到
//!   事件日志；配置了路由的通道额外产生回灌：
//!   - 出站帧改写为目标通道上的入站帧，序列号按目标通道独立分配；
//!   - 回灌帧的 `Processed` 回执再次改写回源通道，闭合发送方的背压环；
//!   - 出站流会话改写为目标通道的会话通告，接收端留待 `accept_stream`；
//!   - 出站关闭改写为目标通道的入站关闭；
//! - 未配置路由的流会话由替身自行排空：逐块确认，复现真实编排器的接收
//!   节奏；
//! - 每个会话记录分块数、上行确认数与结束标记，供锁步与“每块恰好一次
//!   确认”类断言使用。
//!
//! ## 并发模型（How）
//! - 单把 `parking_lot::Mutex` 守护全部状态，`tokio::sync::Notify` 驱动
//!   `wait_*` 族等待；等待前先 `enable` 再检查，规避错过唤醒。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use weave_core::error::LinkError;
use weave_core::link::{OrchestratorLink, StreamReceiver, StreamSender};
use weave_core::message::{
    Ack, ChannelId, DataFrame, FromRunner, SequenceNumber, SessionId, StreamHeader, StreamOpen,
    ToRunner,
};

/// 单个流会话的观测计数。
#[derive(Default)]
struct SessionCounters {
    chunks: usize,
    advances: usize,
    finished: bool,
}

struct OrchestratorState {
    /// 运行端发出的全部连接级消息，按到达顺序记录。
    events: Vec<FromRunner>,
    /// 出站通道到入站通道的回灌路由。
    routes: HashMap<ChannelId, ChannelId>,
    /// 各入站通道的下一个投递序列号。
    inbound_sequences: HashMap<ChannelId, SequenceNumber>,
    /// 回灌投递（入站通道、入站序列号）到原始发送（源通道、源序列号）的
    /// 关联，用于把 `Processed` 回执送回发送方。
    pending_echoes: HashMap<(ChannelId, SequenceNumber), (ChannelId, SequenceNumber)>,
    sessions: HashMap<SessionId, Arc<Mutex<SessionCounters>>>,
    /// 已通告但尚未被 `accept_stream` 领取的接收端。
    pending_accepts: HashMap<SessionId, MemoryStreamReceiver>,
    opened_sessions: Vec<SessionId>,
    next_session: u64,
}

impl OrchestratorState {
    fn next_inbound_sequence(&mut self, channel: &ChannelId) -> SequenceNumber {
        let slot = self
            .inbound_sequences
            .entry(channel.clone())
            .or_insert(SequenceNumber::FIRST);
        let sequence = *slot;
        *slot = slot.next();
        sequence
    }
}

struct MemoryShared {
    state: Mutex<OrchestratorState>,
    notify: Notify,
    inbound: mpsc::UnboundedSender<ToRunner>,
}

impl MemoryShared {
    fn allocate_session(
        shared: &Arc<MemoryShared>,
        state: &mut OrchestratorState,
    ) -> (SessionId, MemoryStreamSender, MemoryStreamReceiver) {
        let session = SessionId::new(state.next_session);
        state.next_session += 1;
        let counters = Arc::new(Mutex::new(SessionCounters::default()));
        state.sessions.insert(session, Arc::clone(&counters));
        state.opened_sessions.push(session);

        // 容量 1 的数据与确认通道天然复现逐块锁步。
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(1);
        let (ack_tx, ack_rx) = mpsc::channel::<()>(1);
        let sender = MemoryStreamSender {
            session,
            data: Some(data_tx),
            acks: ack_rx,
        };
        let receiver = MemoryStreamReceiver {
            data: data_rx,
            acks: ack_tx,
            counters,
            shared: Arc::clone(shared),
        };
        (session, sender, receiver)
    }
}

/// 进程内编排器替身。
pub struct MemoryOrchestrator {
    shared: Arc<MemoryShared>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ToRunner>>>,
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(MemoryShared {
                state: Mutex::new(OrchestratorState {
                    events: Vec::new(),
                    routes: HashMap::new(),
                    inbound_sequences: HashMap::new(),
                    pending_echoes: HashMap::new(),
                    sessions: HashMap::new(),
                    pending_accepts: HashMap::new(),
                    opened_sessions: Vec::new(),
                    next_session: 1,
                }),
                notify: Notify::new(),
                inbound: inbound_tx,
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// 替身侧的连接句柄，可克隆给任意多个端点。
    pub fn link(&self) -> Arc<dyn OrchestratorLink> {
        Arc::new(MemoryLink {
            shared: Arc::clone(&self.shared),
        })
    }

    /// 把 `from` 通道的出站消息回灌为 `to` 通道的入站消息。
    pub fn route(&self, from: impl Into<ChannelId>, to: impl Into<ChannelId>) {
        self.shared
            .state
            .lock()
            .routes
            .insert(from.into(), to.into());
    }

    /// 注入一条编排器发起的入站消息。
    pub fn inject(&self, message: ToRunner) {
        let _ = self.shared.inbound.send(message);
    }

    /// 领取入站消息接收端，交给调度循环；只可领取一次。
    pub fn take_inbound(&self) -> mpsc::UnboundedReceiver<ToRunner> {
        self.inbound_rx
            .lock()
            .take()
            .expect("入站接收端只能领取一次")
    }

    /// 当前事件日志的快照。
    pub fn events(&self) -> Vec<FromRunner> {
        self.shared.state.lock().events.clone()
    }

    /// 挂起直到事件日志满足谓词。
    pub async fn wait_for(&self, predicate: impl Fn(&[FromRunner]) -> bool) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if predicate(&self.shared.state.lock().events) {
                return;
            }
            notified.await;
        }
    }

    /// 开一个游离会话：接收端登记待领取，发送端交给调用方。
    ///
    /// 不产生任何连接级消息，供直接驱动入站流路径的测试使用。
    pub async fn open_loose_stream(&self) -> (Box<dyn StreamSender>, SessionId) {
        let mut state = self.shared.state.lock();
        let (session, sender, receiver) = MemoryShared::allocate_session(&self.shared, &mut state);
        state.pending_accepts.insert(session, receiver);
        (Box::new(sender), session)
    }

    fn counters(&self, session: SessionId) -> Arc<Mutex<SessionCounters>> {
        Arc::clone(
            self.shared
                .state
                .lock()
                .sessions
                .get(&session)
                .expect("未知的流会话"),
        )
    }

    /// 已打开的全部会话，按打开顺序。
    pub fn sessions(&self) -> Vec<SessionId> {
        self.shared.state.lock().opened_sessions.clone()
    }

    /// 会话至今收到的分块数。
    pub fn session_chunks(&self, session: SessionId) -> usize {
        self.counters(session).lock().chunks
    }

    /// 会话至今发出的上行确认数。
    pub fn session_advances(&self, session: SessionId) -> usize {
        self.counters(session).lock().advances
    }

    /// 挂起直到任意会话被打开，返回最近打开的那个。
    pub async fn wait_any_session(&self) -> SessionId {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(session) = self.shared.state.lock().opened_sessions.last().copied() {
                return session;
            }
            notified.await;
        }
    }

    /// 挂起直到会话收到至少 `count` 个分块。
    pub async fn wait_session_chunks(&self, session: SessionId, count: usize) {
        let counters = self.counters(session);
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if counters.lock().chunks >= count {
                return;
            }
            notified.await;
        }
    }

    /// 挂起直到会话正常结束。
    pub async fn wait_session_finished(&self, session: SessionId) {
        let counters = self.counters(session);
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if counters.lock().finished {
                return;
            }
            notified.await;
        }
    }
}

impl Default for MemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryLink {
    shared: Arc<MemoryShared>,
}

#[async_trait]
impl OrchestratorLink for MemoryLink {
    async fn send(&self, event: FromRunner) -> Result<(), LinkError> {
        let mut echoes = Vec::new();
        {
            let mut state = self.shared.state.lock();
            match &event {
                FromRunner::Frame(frame) => {
                    if let Some(dest) = state.routes.get(&frame.channel).cloned() {
                        let sequence = state.next_inbound_sequence(&dest);
                        state.pending_echoes.insert(
                            (dest.clone(), sequence),
                            (frame.channel.clone(), frame.sequence),
                        );
                        echoes.push(ToRunner::Frame(DataFrame {
                            channel: dest,
                            sequence,
                            payload: frame.payload.clone(),
                        }));
                    }
                }
                FromRunner::Processed(ack) => {
                    if let Some((source, source_sequence)) = state
                        .pending_echoes
                        .remove(&(ack.channel.clone(), ack.sequence))
                    {
                        echoes.push(ToRunner::Processed(Ack {
                            channel: source,
                            sequence: source_sequence,
                        }));
                    }
                }
                FromRunner::Close { channel } => {
                    if let Some(dest) = state.routes.get(channel).cloned() {
                        echoes.push(ToRunner::Close { channel: dest });
                    }
                }
                FromRunner::Identify { .. } | FromRunner::Initialized { .. } => {}
            }
            state.events.push(event);
        }
        for message in echoes {
            let _ = self.shared.inbound.send(message);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn open_stream(&self, header: StreamHeader) -> Result<Box<dyn StreamSender>, LinkError> {
        let mut echo = None;
        let mut drain = None;
        let sender = {
            let mut state = self.shared.state.lock();
            let (session, sender, receiver) =
                MemoryShared::allocate_session(&self.shared, &mut state);
            match state.routes.get(&header.channel).cloned() {
                Some(dest) => {
                    let sequence = state.next_inbound_sequence(&dest);
                    state.pending_echoes.insert(
                        (dest.clone(), sequence),
                        (header.channel.clone(), header.sequence),
                    );
                    state.pending_accepts.insert(session, receiver);
                    echo = Some(ToRunner::StreamOpen(StreamOpen {
                        channel: dest,
                        sequence,
                        session,
                    }));
                }
                None => drain = Some(receiver),
            }
            sender
        };
        if let Some(message) = echo {
            let _ = self.shared.inbound.send(message);
        }
        if let Some(mut receiver) = drain {
            // 无路由的会话由替身排空：逐块确认，复现真实接收节奏。
            tokio::spawn(async move {
                while let Ok(Some(_)) = receiver.recv().await {
                    if receiver.advance().await.is_err() {
                        return;
                    }
                }
            });
        }
        self.shared.notify.notify_waiters();
        Ok(Box::new(sender))
    }

    async fn accept_stream(&self, session: SessionId) -> Result<Box<dyn StreamReceiver>, LinkError> {
        match self.shared.state.lock().pending_accepts.remove(&session) {
            Some(receiver) => Ok(Box::new(receiver)),
            None => Err(LinkError::SessionRejected {
                detail: format!("session {session} was never announced"),
            }),
        }
    }
}

struct MemoryStreamSender {
    session: SessionId,
    /// `None` 表示已发出结束标记。
    data: Option<mpsc::Sender<Bytes>>,
    acks: mpsc::Receiver<()>,
}

#[async_trait]
impl StreamSender for MemoryStreamSender {
    fn session(&self) -> SessionId {
        self.session
    }

    async fn chunk(&mut self, chunk: Bytes) -> Result<(), LinkError> {
        let data = self.data.as_ref().ok_or(LinkError::ConnectionClosed)?;
        data.send(chunk)
            .await
            .map_err(|_| LinkError::ConnectionClosed)?;
        // 锁步契约：接收端确认后才返回。
        match self.acks.recv().await {
            Some(()) => Ok(()),
            None => Err(LinkError::ConnectionClosed),
        }
    }

    async fn finish(&mut self) -> Result<(), LinkError> {
        self.data.take();
        Ok(())
    }
}

struct MemoryStreamReceiver {
    data: mpsc::Receiver<Bytes>,
    acks: mpsc::Sender<()>,
    counters: Arc<Mutex<SessionCounters>>,
    shared: Arc<MemoryShared>,
}

#[async_trait]
impl StreamReceiver for MemoryStreamReceiver {
    async fn recv(&mut self) -> Result<Option<Bytes>, LinkError> {
        match self.data.recv().await {
            Some(chunk) => {
                self.counters.lock().chunks += 1;
                self.shared.notify.notify_waiters();
                Ok(Some(chunk))
            }
            None => {
                self.counters.lock().finished = true;
                self.shared.notify.notify_waiters();
                Ok(None)
            }
        }
    }

    async fn advance(&mut self) -> Result<(), LinkError> {
        self.counters.lock().advances += 1;
        self.shared.notify.notify_waiters();
        // 发送端可能已在结束标记后离场；此时确认无人消费，不构成错误。
        let _ = self.acks.send(()).await;
        Ok(())
    }
}
