//! # fanout 模块说明
//!
//! ## 角色定位（Why）
//! - 一个入站流会话要喂给通道上的全部消费者，但线缆只允许读一次；本模块
//!   实现“共享分块缓冲 + 确认门控推进”的扇出：分块进入共享 FIFO，各分支
//!   独立推进，头部分块在**所有存活分支都越过它**之后驱逐，驱逐时恰好
//!   发出一次上行确认——无论分支有多少，单生产者的流控点始终只有一个。
//!
//! ## 行为契约（What）
//! - 分支按到达顺序观察同一分块序列（`Bytes` 克隆为引用计数，不复制）；
//! - 每个分块恰好触发一次 [`StreamReceiver::advance`]，与分支数无关；
//! - 会话结束或出错终止所有分支：错误向每个分支各交付一次，随后序列结束；
//! - 分支中途被丢弃即行分离，不再参与驱逐屏障——迟缓或被放弃的兄弟消费者
//!   不得卡死会话。
//!
//! ## 并发模型（How）
//! - `parking_lot::Mutex` 守护缓冲与各分支推进位置；`tokio::sync::Notify`
//!   唤醒等新块的分支，等待前先 `enable` 以免错过唤醒；
//! - 泵任务独占 [`StreamReceiver`]：收块、入缓冲、等驱逐信号、上行确认，
//!   逐块锁步，缓冲占用天然有界。

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use weave_core::convertor::ChunkStream;
use weave_core::error::{ChannelError, LinkError};
use weave_core::link::StreamReceiver;
use weave_core::message::SessionId;

/// 共享扇出状态。
struct FanoutState {
    /// 尚未被全部分支越过的分块。
    buffer: VecDeque<Bytes>,
    /// `buffer` 头部分块的绝对序号。
    base: u64,
    /// 各分支的绝对推进位置；`None` 表示分支已分离。
    positions: Vec<Option<u64>>,
    /// 会话已正常结束。
    finished: bool,
    /// 会话中途失败的原因。
    failure: Option<ChannelError>,
}

/// 一个流会话的扇出枢纽。
pub(crate) struct Fanout {
    session: SessionId,
    state: Mutex<FanoutState>,
    notify: Notify,
    /// 每驱逐一个分块发送一个单元，泵任务据此发出上行确认。
    evictions: mpsc::UnboundedSender<()>,
}

impl Fanout {
    /// 建立拥有 `branches` 个分支的枢纽，返回驱逐信号的接收端。
    pub(crate) fn new(
        session: SessionId,
        branches: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (evictions, eviction_rx) = mpsc::unbounded_channel();
        let fanout = Arc::new(Self {
            session,
            state: Mutex::new(FanoutState {
                buffer: VecDeque::new(),
                base: 0,
                positions: vec![Some(0); branches],
                finished: false,
                failure: None,
            }),
            notify: Notify::new(),
            evictions,
        });
        (fanout, eviction_rx)
    }

    /// 第 `index` 个分支的分块序列视图。
    pub(crate) fn branch(self: &Arc<Self>, index: usize) -> ChunkStream {
        let guard = BranchGuard {
            fanout: Arc::clone(self),
            index,
            failed: false,
        };
        Box::pin(futures::stream::unfold(guard, |mut guard| async move {
            guard.next().await.map(|item| (item, guard))
        }))
    }

    /// 头部分块被所有存活分支越过时驱逐并发出确认信号；可能连环驱逐。
    fn evict_passed(&self, state: &mut FanoutState) {
        while !state.buffer.is_empty() {
            let head = state.base;
            let all_past = state
                .positions
                .iter()
                .all(|position| position.is_none_or(|p| p > head));
            if !all_past {
                break;
            }
            state.buffer.pop_front();
            state.base += 1;
            // 接收端可能已经退场；此时信号只是无人消费，不构成错误。
            let _ = self.evictions.send(());
        }
    }

    /// 分支退出驱逐屏障。
    fn detach(&self, index: usize) {
        let mut state = self.state.lock();
        if state.positions[index].take().is_some() {
            self.evict_passed(&mut state);
        }
    }

    fn push_chunk(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.buffer.push_back(chunk);
        // 所有分支均已分离时新块立即可驱逐。
        self.evict_passed(&mut state);
        drop(state);
        self.notify.notify_waiters();
    }

    fn mark_finished(&self) {
        self.state.lock().finished = true;
        self.notify.notify_waiters();
    }

    fn mark_failed(&self, error: LinkError) {
        let mut state = self.state.lock();
        state.failure = Some(ChannelError::SessionAborted {
            session: self.session,
            detail: error.to_string(),
        });
        state.finished = true;
        drop(state);
        self.notify.notify_waiters();
    }
}

/// 单个分支的推进游标；丢弃即分离。
struct BranchGuard {
    fanout: Arc<Fanout>,
    index: usize,
    failed: bool,
}

impl BranchGuard {
    async fn next(&mut self) -> Option<Result<Bytes, ChannelError>> {
        if self.failed {
            return None;
        }
        loop {
            let notified = self.fanout.notify.notified();
            tokio::pin!(notified);
            // 先注册唤醒兴趣再检查状态，规避“推块发生在检查与等待之间”的竞态。
            notified.as_mut().enable();
            {
                let mut state = self.fanout.state.lock();
                let position = match state.positions[self.index] {
                    Some(position) => position,
                    None => return None,
                };
                let available = state.base + state.buffer.len() as u64;
                if position < available {
                    let chunk = state.buffer[(position - state.base) as usize].clone();
                    state.positions[self.index] = Some(position + 1);
                    self.fanout.evict_passed(&mut state);
                    return Some(Ok(chunk));
                }
                if let Some(failure) = state.failure.clone() {
                    self.failed = true;
                    return Some(Err(failure));
                }
                if state.finished {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        self.fanout.detach(self.index);
    }
}

/// 泵任务：独占接收端，收块入缓冲，等驱逐后上行确认。
///
/// 会话结束或失败后返回；泵在通道级 `Processed` 发出之后也可能仍在运行
/// （透传分支尚未排空时），因此它是独立任务而非完成屏障的一部分。
pub(crate) async fn pump(
    fanout: Arc<Fanout>,
    mut receiver: Box<dyn StreamReceiver>,
    mut evictions: mpsc::UnboundedReceiver<()>,
) {
    loop {
        match receiver.recv().await {
            Ok(Some(chunk)) => {
                fanout.push_chunk(chunk);
                // 等该块被驱逐后才准许发送方继续：单一流控点。
                if evictions.recv().await.is_none() {
                    return;
                }
                if let Err(error) = receiver.advance().await {
                    tracing::error!(session = %fanout.session, %error, "failed to acknowledge a stream chunk");
                    fanout.mark_failed(error);
                    return;
                }
            }
            Ok(None) => {
                fanout.mark_finished();
                return;
            }
            Err(error) => {
                tracing::error!(session = %fanout.session, %error, "stream session failed mid-flight");
                fanout.mark_failed(error);
                return;
            }
        }
    }
}
