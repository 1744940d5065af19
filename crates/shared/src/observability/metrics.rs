//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 导出器自带 HTTP listener，在独立端口暴露 `/metrics` 供 Prometheus 抓取。

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    pub addr: SocketAddr,
}

/// 安装全局 recorder 并启动指标 HTTP 监听
///
/// 需要在 tokio runtime 内调用。
pub fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    register_common_metrics(&config.service_name);
    info!("Metrics server listening on {}", addr);

    Ok(MetricsHandle { addr })
}

/// 注册指标描述，出现在 /metrics 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("messages_consumed_total", "Total number of consumed bus messages");
    metrics::describe_counter!(
        "message_errors_total",
        "Total number of messages whose handling reported an error"
    );
    metrics::describe_counter!("session_errors_total", "Total number of consumer session errors");
    metrics::describe_counter!(
        "notifications_dispatched_total",
        "Total number of dispatched notifications by outcome"
    );
    metrics::describe_histogram!(
        "rate_limit_wait_seconds",
        "Time spent waiting for an outbound rate limit permit"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 记录消费到一条消息
pub fn record_message_consumed(topic: &str) {
    metrics::counter!("messages_consumed_total", "topic" => topic.to_string()).increment(1);
}

/// 记录消息处理错误
pub fn record_message_error(topic: &str, kind: &'static str) {
    metrics::counter!(
        "message_errors_total",
        "topic" => topic.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// 记录消费会话错误
pub fn record_session_error(topic: &str) {
    metrics::counter!("session_errors_total", "topic" => topic.to_string()).increment(1);
}

/// 记录一次通知分发结果
pub fn record_dispatch(purpose: &'static str, channel: &'static str, outcome: &'static str) {
    metrics::counter!(
        "notifications_dispatched_total",
        "purpose" => purpose,
        "channel" => channel,
        "outcome" => outcome
    )
    .increment(1);
}

/// 记录等待限流许可的耗时
pub fn record_rate_limit_wait(channel: &'static str, waited: Duration) {
    metrics::histogram!("rate_limit_wait_seconds", "channel" => channel)
        .record(waited.as_secs_f64());
}
