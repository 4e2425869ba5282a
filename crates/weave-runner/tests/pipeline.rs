//! 端到端管线测试：源处理器 → 回显处理器 → 汇端消费者。
//!
//! 编排器替身把出站消息按路由表回灌成入站消息，两个方向的背压环
//! （入站接受屏障、出站 FIFO 回执）在同一进程内完整闭合。拓扑：
//!
//! ```text
//! source/out ──路由──▶ echo/in ─▶ [echo] ─▶ echo/out ──路由──▶ sink/in
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use weave_core::prelude::*;
use weave_runner::testkit::MemoryOrchestrator;
use weave_runner::{Runner, Writer};

/// 数据源：`Start` 后写出固定条目并关闭通道。
struct SourceProcessor {
    output: Writer,
    items: Vec<&'static str>,
}

#[async_trait]
impl Processor for SourceProcessor {
    async fn produce(&self) -> anyhow::Result<()> {
        for item in &self.items {
            self.output.string(item).await?;
        }
        self.output.close().await?;
        Ok(())
    }
}

/// 流式数据源：单次流会话发出两块载荷。
struct StreamingSource {
    output: Writer,
}

#[async_trait]
impl Processor for StreamingSource {
    async fn produce(&self) -> anyhow::Result<()> {
        let chunks = stream::iter(vec![Bytes::from_static(b"Hello"), Bytes::from_static(b"World")]);
        self.output.stream(chunks).await?;
        self.output.close().await?;
        Ok(())
    }
}

/// 回显：入站条目原样写往出站通道，入站关闭后随之关闭出站。
struct EchoProcessor {
    input: tokio::sync::Mutex<weave_runner::Consumer<Payload>>,
    output: Writer,
}

#[async_trait]
impl Processor for EchoProcessor {
    async fn transform(&self) -> anyhow::Result<()> {
        let mut input = self.input.lock().await;
        while let Some(item) = input.next().await {
            self.output.payload(item?).await?;
        }
        self.output.close().await?;
        Ok(())
    }
}

/// 测试日志输出；重复初始化安全。
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 搭起两跳回灌拓扑并启动调度循环。
fn bootstrap(orchestrator: &MemoryOrchestrator) -> Runner {
    init_tracing();
    orchestrator.route("source/out", "echo/in");
    orchestrator.route("echo/out", "sink/in");

    let runner = Runner::new(RunnerId::new("worker-1"), orchestrator.link());
    let inbound = orchestrator.take_inbound();
    tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(inbound).await }
    });
    runner
}

async fn assemble_echo(runner: &Runner) {
    let echo = EchoProcessor {
        input: tokio::sync::Mutex::new(runner.create_reader("echo/in").payloads()),
        output: runner.create_writer("echo/out"),
    };
    runner
        .add_processor("urn:proc:echo", Arc::new(echo))
        .await
        .expect("回显处理器应装配成功");
}

#[tokio::test]
async fn frames_flow_through_the_pipeline_and_close_propagates() {
    let orchestrator = MemoryOrchestrator::new();
    let runner = bootstrap(&orchestrator);

    let mut sink = runner.create_reader("sink/in").strings();
    assemble_echo(&runner).await;
    runner
        .add_processor(
            "urn:proc:source",
            Arc::new(SourceProcessor {
                output: runner.create_writer("source/out"),
                items: vec!["Hello", "world"],
            }),
        )
        .await
        .expect("源处理器应装配成功");

    orchestrator.inject(ToRunner::Start);

    let mut seen = Vec::new();
    while let Some(item) = sink.next().await {
        seen.push(item.expect("帧路径不应出错"));
    }
    assert_eq!(seen, vec!["Hello", "world"]);

    // 关闭逐跳传播：source/out 与 echo/out 各一条关闭帧。
    orchestrator
        .wait_for(|events| {
            events
                .iter()
                .filter(|event| matches!(event, FromRunner::Close { .. }))
                .count()
                == 2
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_payloads_stream_end_to_end_with_one_advance_per_chunk() {
    let orchestrator = MemoryOrchestrator::new();
    let runner = bootstrap(&orchestrator);

    let sink_reader = runner.create_reader("sink/in");
    let mut sink = sink_reader.strings();
    // 第二个消费者验证上行确认次数与扇出分支数无关。
    let raw = sink_reader.buffers();
    let raw_task = tokio::spawn(async move {
        let mut raw = raw;
        let mut collected = Vec::new();
        while let Some(item) = raw.next().await {
            collected.push(item.expect("流路径不应出错"));
        }
        collected
    });

    assemble_echo(&runner).await;
    runner
        .add_processor(
            "urn:proc:streaming-source",
            Arc::new(StreamingSource {
                output: runner.create_writer("source/out"),
            }),
        )
        .await
        .expect("流式源应装配成功");

    orchestrator.inject(ToRunner::Start);

    let mut seen = Vec::new();
    while let Some(item) = sink.next().await {
        seen.push(item.expect("流路径不应出错"));
    }
    assert_eq!(seen, vec!["HelloWorld"], "聚合消费者应看到拼接后的载荷");
    assert_eq!(
        raw_task.await.expect("消费任务不应崩溃"),
        vec![Bytes::from_static(b"HelloWorld")]
    );

    // 两跳各开一个会话；每块恰好一次上行确认，无论该跳有几个消费者。
    let sessions = orchestrator.sessions();
    assert_eq!(sessions.len(), 2, "源到回显、回显到汇端各一个流会话");
    for session in sessions {
        orchestrator.wait_session_finished(session).await;
        assert_eq!(orchestrator.session_chunks(session), 2);
        assert_eq!(orchestrator.session_advances(session), 2);
    }
}

#[tokio::test]
async fn graph_resolver_assembles_the_pipeline_from_orchestrator_messages() {
    struct EchoResolver;

    #[async_trait]
    impl weave_runner::GraphResolver for EchoResolver {
        async fn resolve_pipeline(
            &self,
            description: &str,
            runner: &Runner,
        ) -> anyhow::Result<()> {
            // 本替身约定图描述为 `入站通道 -> 出站通道`。
            let (input, output) = description
                .split_once("->")
                .ok_or_else(|| anyhow::anyhow!("malformed pipeline description"))?;
            runner.create_reader(input.trim());
            runner.create_writer(output.trim());
            Ok(())
        }

        async fn resolve_processor(
            &self,
            spec: &ProcessorSpec,
            runner: &Runner,
        ) -> anyhow::Result<Arc<dyn Processor>> {
            let channels: serde_json::Value = serde_json::from_str(&spec.config)?;
            let input = channels["input"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("missing input channel"))?;
            let output = channels["output"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("missing output channel"))?;
            Ok(Arc::new(EchoProcessor {
                input: tokio::sync::Mutex::new(runner.create_reader(input).payloads()),
                output: runner.create_writer(output),
            }))
        }
    }

    init_tracing();
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.route("echo/out", "sink/in");

    let runner = Runner::new(RunnerId::new("worker-2"), orchestrator.link());
    runner.set_graph_resolver(Arc::new(EchoResolver));
    let inbound = orchestrator.take_inbound();
    tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(inbound).await }
    });

    let mut sink = runner.create_reader("sink/in").strings();

    orchestrator.inject(ToRunner::Pipeline {
        description: "echo/in -> echo/out".into(),
    });
    orchestrator.inject(ToRunner::Processor(ProcessorSpec {
        uri: "urn:proc:echo".into(),
        config: r#"{"input":"echo/in","output":"echo/out"}"#.into(),
    }));

    orchestrator
        .wait_for(|events| {
            events.iter().any(|event| {
                matches!(event, FromRunner::Initialized { processor } if processor == "urn:proc:echo")
            })
        })
        .await;

    // 经调度循环注入数据：处理器由图消息装配，数据路径应已就绪。
    orchestrator.inject(ToRunner::Frame(DataFrame {
        channel: ChannelId::new("echo/in"),
        sequence: SequenceNumber::FIRST,
        payload: Bytes::from_static(b"via resolver"),
    }));
    orchestrator.inject(ToRunner::Close {
        channel: ChannelId::new("echo/in"),
    });

    assert_eq!(sink.next().await.unwrap().unwrap(), "via resolver");
    assert!(sink.next().await.is_none(), "关闭应传播到汇端");
}
