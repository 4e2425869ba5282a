//! # runner 模块说明
//!
//! ## 角色定位（Why）
//! - 运行端的装配与调度中枢：持有通道端点注册表与处理器清单，把唯一 RPC
//!   连接上的入站消息逐条派发到对应端点，并驱动处理器生命周期
//!   （`init` → `transform` 长驻 → `Start` 后 `produce`）。
//!
//! ## 行为契约（What）
//! - 每条通道至多各一个 Reader 与 Writer：重复创建返回已注册的端点句柄；
//! - 调度循环**永不阻塞**：所有可能挂起的处理（接受屏障、在途流推迟的
//!   关闭、图解析）都交给后台任务，下一条消息的派发不受影响；
//! - 指向未注册通道的消息是协议失步：响亮记录错误日志后忽略，运行端
//!   继续服务其余通道；
//! - 图描述与处理器装配说明对本层不透明，整体转交图解析协作方。
//!
//! ## 风险提示（Trade-offs）
//! - 远端关闭在后台任务中执行：Writer 有在途流时关闭会推迟，若在调度
//!   循环内等待，会卡死后续所有消息的派发。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use weave_core::error::LinkError;
use weave_core::link::OrchestratorLink;
use weave_core::message::{ChannelId, FromRunner, ProcessorSpec, RunnerId, ToRunner};
use weave_core::processor::Processor;

use crate::reader::Reader;
use crate::writer::Writer;

/// 图解析协作方：把不透明的图描述与装配说明变成端点与处理器。
///
/// # 教案式注释
/// - **意图 (Why)**：运行端核心不理解图描述的编码（原始协议中为 JSON），
///   解析与处理器构造属于部署方的装配代码；
/// - **契约 (What)**：`resolve_pipeline` 应按图描述调用 [`Runner`] 的
///   端点创建接口；`resolve_processor` 返回的处理器由运行端接管生命周期；
/// - **风险 (Trade-offs)**：解析失败只记录日志——编排器可能推送本端不
///   认识的图，运行端必须存活。
#[async_trait]
pub trait GraphResolver: Send + Sync + 'static {
    /// 消化一份管线图描述，装配其中属于本运行端的通道端点。
    async fn resolve_pipeline(&self, description: &str, runner: &Runner) -> anyhow::Result<()>;

    /// 按装配说明构造一个处理器实例。
    async fn resolve_processor(
        &self,
        spec: &ProcessorSpec,
        runner: &Runner,
    ) -> anyhow::Result<Arc<dyn Processor>>;
}

struct RunnerInner {
    runner: RunnerId,
    link: Arc<dyn OrchestratorLink>,
    readers: DashMap<ChannelId, Reader>,
    writers: DashMap<ChannelId, Writer>,
    resolver: Mutex<Option<Arc<dyn GraphResolver>>>,
    /// 已装配的处理器，`Start` 时逐个启动 `produce`。
    processors: Mutex<Vec<(String, Arc<dyn Processor>)>>,
    /// 长驻处理器任务，调度循环结束后汇合。
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// 运行端进程的调度中枢句柄。
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(runner: RunnerId, link: Arc<dyn OrchestratorLink>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                runner,
                link,
                readers: DashMap::new(),
                writers: DashMap::new(),
                resolver: Mutex::new(None),
                processors: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 安装图解析协作方；未安装时图相关消息仅记录错误。
    pub fn set_graph_resolver(&self, resolver: Arc<dyn GraphResolver>) {
        *self.inner.resolver.lock() = Some(resolver);
    }

    /// 本运行端的标识。
    pub fn id(&self) -> &RunnerId {
        &self.inner.runner
    }

    /// 获取（或创建）某通道的入站端点；每通道至多一个。
    pub fn create_reader(&self, channel: impl Into<ChannelId>) -> Reader {
        let channel = channel.into();
        self.inner
            .readers
            .entry(channel.clone())
            .or_insert_with(|| Reader::new(channel, Arc::clone(&self.inner.link)))
            .clone()
    }

    /// 获取（或创建）某通道的出站端点；每通道至多一个。
    pub fn create_writer(&self, channel: impl Into<ChannelId>) -> Writer {
        let channel = channel.into();
        self.inner
            .writers
            .entry(channel.clone())
            .or_insert_with(|| {
                Writer::new(
                    channel,
                    self.inner.runner.clone(),
                    Arc::clone(&self.inner.link),
                )
            })
            .clone()
    }

    /// 装配一个处理器：`init`、上报 `Initialized`、启动长驻 `transform`。
    pub async fn add_processor(
        &self,
        name: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> anyhow::Result<()> {
        let name = name.into();
        processor.init().await?;
        tracing::info!(processor = %name, "processor initialized");
        self.inner
            .processors
            .lock()
            .push((name.clone(), Arc::clone(&processor)));
        self.inner
            .link
            .send(FromRunner::Initialized {
                processor: name.clone(),
            })
            .await?;

        let transform = tokio::spawn(async move {
            if let Err(error) = processor.transform().await {
                tracing::error!(processor = %name, %error, "transform task failed");
            }
        });
        self.inner.tasks.lock().push(transform);
        Ok(())
    }

    /// 调度循环：自报标识，随后逐条派发入站消息直至连接收尾，
    /// 最后汇合全部处理器任务。
    pub async fn run(
        &self,
        mut inbound: mpsc::UnboundedReceiver<ToRunner>,
    ) -> Result<(), LinkError> {
        self.inner
            .link
            .send(FromRunner::Identify {
                runner: self.inner.runner.clone(),
            })
            .await?;
        tracing::info!(runner = %self.inner.runner, "runner identified, entering the dispatch loop");

        while let Some(message) = inbound.recv().await {
            self.handle_message(message);
        }

        tracing::info!(runner = %self.inner.runner, "inbound closed, joining processor tasks");
        self.join_tasks().await;
        Ok(())
    }

    /// 派发一条入站消息；同步返回，耗时处理交给后台任务。
    pub fn handle_message(&self, message: ToRunner) {
        match message {
            ToRunner::Frame(frame) => match self.inner.readers.get(&frame.channel) {
                Some(reader) => reader.handle_frame(frame),
                None => {
                    tracing::error!(channel = %frame.channel, "data frame for an unregistered channel");
                }
            },
            ToRunner::StreamOpen(open) => match self.inner.readers.get(&open.channel) {
                Some(reader) => reader.handle_stream(open),
                None => {
                    tracing::error!(channel = %open.channel, session = %open.session, "stream session for an unregistered channel");
                }
            },
            ToRunner::Processed(ack) => match self.inner.writers.get(&ack.channel) {
                Some(writer) => writer.handled(),
                None => {
                    tracing::error!(channel = %ack.channel, "processed-acknowledgment for an unregistered channel");
                }
            },
            ToRunner::Close { channel } => self.handle_close(channel),
            ToRunner::Pipeline { description } => match self.resolver() {
                Some(resolver) => {
                    let runner = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = resolver.resolve_pipeline(&description, &runner).await {
                            tracing::error!(%error, "failed to resolve a pipeline description");
                        }
                    });
                }
                None => {
                    tracing::error!("pipeline description received but no graph resolver is installed");
                }
            },
            ToRunner::Processor(spec) => match self.resolver() {
                Some(resolver) => {
                    let runner = self.clone();
                    tokio::spawn(async move {
                        let processor = match resolver.resolve_processor(&spec, &runner).await {
                            Ok(processor) => processor,
                            Err(error) => {
                                tracing::error!(uri = %spec.uri, %error, "failed to resolve a processor spec");
                                return;
                            }
                        };
                        if let Err(error) = runner.add_processor(spec.uri.clone(), processor).await
                        {
                            tracing::error!(uri = %spec.uri, %error, "failed to assemble a processor");
                        }
                    });
                }
                None => {
                    tracing::error!(uri = %spec.uri, "processor spec received but no graph resolver is installed");
                }
            },
            ToRunner::Start => self.start_producers(),
        }
    }

    fn resolver(&self) -> Option<Arc<dyn GraphResolver>> {
        self.inner.resolver.lock().clone()
    }

    fn handle_close(&self, channel: ChannelId) {
        let mut known = false;
        if let Some(reader) = self.inner.readers.get(&channel) {
            known = true;
            reader.close();
        }
        if let Some(writer) = self.inner.writers.get(&channel) {
            known = true;
            let writer = writer.clone();
            // Writer 有在途流时关闭会推迟；调度循环不得在此等待。
            tokio::spawn(async move {
                if let Err(error) = writer.close_on_remote_request().await {
                    tracing::error!(channel = %writer.channel(), %error, "remote close failed");
                }
            });
        }
        if !known {
            tracing::error!(channel = %channel, "close for an unregistered channel");
        }
    }

    fn start_producers(&self) {
        let processors: Vec<(String, Arc<dyn Processor>)> =
            self.inner.processors.lock().clone();
        tracing::info!(count = processors.len(), "starting producers");
        for (name, processor) in processors {
            let produce = tokio::spawn(async move {
                if let Err(error) = processor.produce().await {
                    tracing::error!(processor = %name, %error, "produce task failed");
                }
            });
            self.inner.tasks.lock().push(produce);
        }
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                tracing::error!(%error, "processor task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemoryOrchestrator;
    use bytes::Bytes;
    use weave_core::message::{Ack, DataFrame, SequenceNumber};

    fn runner_for(orchestrator: &MemoryOrchestrator) -> Runner {
        Runner::new(RunnerId::new("test-runner"), orchestrator.link())
    }

    #[tokio::test]
    async fn endpoint_creation_is_idempotent_per_channel() {
        let orchestrator = MemoryOrchestrator::new();
        let runner = runner_for(&orchestrator);

        let first = runner.create_reader("dup/in");
        let mut strings = first.strings();
        // 第二次创建必须返回同一端点：经它派发的帧对第一次注册的消费者可见。
        let _second = runner.create_reader("dup/in");
        runner.handle_message(ToRunner::Frame(DataFrame {
            channel: ChannelId::new("dup/in"),
            sequence: SequenceNumber::FIRST,
            payload: Bytes::from_static(b"shared"),
        }));
        runner.handle_message(ToRunner::Close {
            channel: ChannelId::new("dup/in"),
        });

        assert_eq!(strings.next().await.unwrap().unwrap(), "shared");
        assert!(strings.next().await.is_none());

        let writer_a = runner.create_writer("dup/out");
        let _writer_b = runner.create_writer("dup/out");
        let mut send = Box::pin(writer_a.string("one endpoint"));
        assert!(futures::poll!(send.as_mut()).is_pending());
        // 回执派发走注册表，能解除第一把句柄的发送即证明是同一端点。
        runner.handle_message(ToRunner::Processed(Ack {
            channel: ChannelId::new("dup/out"),
            sequence: SequenceNumber::FIRST,
        }));
        send.await.expect("同一端点的发送应被回执解除");
    }

    #[tokio::test]
    async fn messages_for_unregistered_channels_are_ignored() {
        let orchestrator = MemoryOrchestrator::new();
        let runner = runner_for(&orchestrator);

        // 全部派发到未注册通道：只记录错误，运行端保持可用。
        runner.handle_message(ToRunner::Frame(DataFrame {
            channel: ChannelId::new("ghost"),
            sequence: SequenceNumber::FIRST,
            payload: Bytes::from_static(b"?"),
        }));
        runner.handle_message(ToRunner::Processed(Ack {
            channel: ChannelId::new("ghost"),
            sequence: SequenceNumber::FIRST,
        }));
        runner.handle_message(ToRunner::Close {
            channel: ChannelId::new("ghost"),
        });

        let reader = runner.create_reader("alive/in");
        let mut strings = reader.strings();
        runner.handle_message(ToRunner::Frame(DataFrame {
            channel: ChannelId::new("alive/in"),
            sequence: SequenceNumber::FIRST,
            payload: Bytes::from_static(b"still here"),
        }));
        assert_eq!(strings.next().await.unwrap().unwrap(), "still here");
    }

    #[tokio::test]
    async fn run_identifies_before_anything_else() {
        let orchestrator = MemoryOrchestrator::new();
        let runner = runner_for(&orchestrator);

        let inbound = orchestrator.take_inbound();
        tokio::spawn(async move { runner.run(inbound).await });

        orchestrator
            .wait_for(|events| !events.is_empty())
            .await;
        assert!(
            matches!(
                &orchestrator.events()[0],
                FromRunner::Identify { runner } if runner.as_str() == "test-runner"
            ),
            "首条连接级消息必须是自报标识"
        );
    }

    struct InitOnly;

    #[async_trait]
    impl Processor for InitOnly {}

    #[tokio::test]
    async fn assembling_a_processor_reports_initialized() {
        let orchestrator = MemoryOrchestrator::new();
        let runner = runner_for(&orchestrator);

        runner
            .add_processor("urn:proc:init-only", Arc::new(InitOnly))
            .await
            .expect("装配应成功");

        assert!(orchestrator.events().iter().any(|event| {
            matches!(event, FromRunner::Initialized { processor } if processor == "urn:proc:init-only")
        }));
    }

    struct StubResolver;

    #[async_trait]
    impl GraphResolver for StubResolver {
        async fn resolve_pipeline(
            &self,
            description: &str,
            runner: &Runner,
        ) -> anyhow::Result<()> {
            // 图描述对核心不透明；本替身约定其为逗号分隔的入站通道清单。
            for channel in description.split(',') {
                runner.create_reader(channel.trim());
            }
            Ok(())
        }

        async fn resolve_processor(
            &self,
            _spec: &ProcessorSpec,
            _runner: &Runner,
        ) -> anyhow::Result<Arc<dyn Processor>> {
            Ok(Arc::new(InitOnly))
        }
    }

    #[tokio::test]
    async fn graph_messages_are_delegated_to_the_resolver() {
        let orchestrator = MemoryOrchestrator::new();
        let runner = runner_for(&orchestrator);
        runner.set_graph_resolver(Arc::new(StubResolver));

        runner.handle_message(ToRunner::Pipeline {
            description: "graph/in".into(),
        });
        runner.handle_message(ToRunner::Processor(ProcessorSpec {
            uri: "urn:proc:stub".into(),
            config: "{}".into(),
        }));

        orchestrator
            .wait_for(|events| {
                events.iter().any(|event| {
                    matches!(event, FromRunner::Initialized { processor } if processor == "urn:proc:stub")
                })
            })
            .await;

        // 图解析已创建入站端点：后续帧应被派发而非判为未注册。
        let mut strings = runner.create_reader("graph/in").strings();
        runner.handle_message(ToRunner::Frame(DataFrame {
            channel: ChannelId::new("graph/in"),
            sequence: SequenceNumber::FIRST,
            payload: Bytes::from_static(b"resolved"),
        }));
        assert_eq!(strings.next().await.unwrap().unwrap(), "resolved");
    }

    struct Counting {
        produced: tokio::sync::Notify,
    }

    #[async_trait]
    impl Processor for Counting {
        async fn produce(&self) -> anyhow::Result<()> {
            self.produced.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_launches_produce_for_every_processor() {
        let orchestrator = MemoryOrchestrator::new();
        let runner = runner_for(&orchestrator);

        let processor = Arc::new(Counting {
            produced: tokio::sync::Notify::new(),
        });
        runner
            .add_processor("urn:proc:counting", Arc::clone(&processor) as Arc<dyn Processor>)
            .await
            .expect("装配应成功");

        let notified = processor.produced.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        runner.handle_message(ToRunner::Start);
        notified.await;
    }
}
