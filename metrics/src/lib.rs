use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use pin_project_lite::pin_project;
use tracing::info;

pub mod stats;

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

pin_project! {
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct TimedFuture<F, C>
    where
        F: Future,
        C: FnOnce(Duration),
    {
        #[pin]
        inner: F,
        start: Instant,
        callback: Option<C>, // This is an Option because the future might be polled even after completion
    }
}

impl<F, C> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    pub fn new(inner: F, callback: C) -> Self {
        Self {
            inner,
            callback: Some(callback),
            start: Instant::now(),
        }
    }
}

impl<F, C> Future for TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.inner.poll(cx);

        if poll_result.is_ready() {
            let elapsed = this.start.elapsed();
            if let Some(callback) = this.callback.take() {
                callback(elapsed);
            }
        }

        poll_result
    }
}

pub fn create_timed_future<F, C>(future: F, callback: C) -> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    TimedFuture::new(future, callback)
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    service_name: &str,
    instance_id: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "vaas"))
        .with_attribute(KeyValue::new("service.name", service_name.to_string()))
        .with_attribute(KeyValue::new("vaas.instance.id", instance_id.to_string()))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    info!(service_name, "metrics exporter installed");
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod allocator {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub allocations: Counter<u64>,
        pub deallocations: Counter<u64>,
        pub evictions: Counter<u64>,
        pub allocate_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("vaas-allocator");
            let allocations = meter
                .u64_counter("vaas.allocator.containers_allocated")
                .with_description("number of containers allocated on machines")
                .build();
            let deallocations = meter
                .u64_counter("vaas.allocator.containers_deallocated")
                .with_description("number of containers released on machines")
                .build();
            let evictions = meter
                .u64_counter("vaas.allocator.containers_evicted")
                .with_description("number of containers evicted to rebalance resources")
                .build();
            let allocate_duration = meter
                .f64_histogram("vaas.allocator.allocate_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("latency of allocating an environment set in seconds")
                .build();
            Metrics {
                allocations,
                deallocations,
                evictions,
                allocate_duration,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecMetrics {
    pub node_runs: Counter<u64>,
    pub node_run_duration: Histogram<f64>,
    pub slices: Counter<u64>,
}

impl Default for ExecMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("vaas-exec");
        let node_runs = meter
            .u64_counter("vaas.exec.node_runs")
            .with_description("number of node executions started in containers")
            .build();
        let node_run_duration = meter
            .f64_histogram("vaas.exec.node_run_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("time until a node output buffer completes in seconds")
            .build();
        let slices = meter
            .u64_counter("vaas.exec.slices")
            .with_description("number of slices run by execution streams, by outcome")
            .build();
        Self {
            node_runs,
            node_run_duration,
            slices,
        }
    }
}
