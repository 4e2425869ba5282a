//! # processor 模块说明
//!
//! ## 角色定位（Why）
//! - 处理器是用户编写的数据变换单元，由图解析协作方构造并持有已解析的
//!   参数（内含 Reader/Writer 句柄）；运行端只负责按生命周期驱动它们。
//!
//! ## 生命周期（What）
//! - `init`：装配完成后立即调用一次，结束后运行端向编排器上报
//!   `Initialized`；
//! - `transform`：装配后即作为长驻任务启动，典型实现循环消费入站通道并
//!   向出站通道写出，入站关闭后返回；
//! - `produce`：编排器发出 `Start` 后调用，数据源型处理器在此产出数据。
//!
//! ## 设计要求（How）
//! - 方法取 `&self`：`transform` 与 `produce` 会作为并发任务同时运行，
//!   处理器自身管理内部状态（通道句柄均可廉价克隆）；
//! - 错误用 `anyhow::Result` 承载——这是面向用户代码的边界，失败由运行端
//!   记录日志，不会拖垮其他处理器。

use async_trait::async_trait;

/// 数据变换单元的生命周期契约。
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// 一次性初始化；默认无事可做。
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 长驻变换循环；默认立即返回（纯数据源处理器）。
    async fn transform(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `Start` 后的数据产出；默认立即返回（纯变换处理器）。
    async fn produce(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
