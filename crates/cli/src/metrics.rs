use prometheus::{
    Encoder, IntCounterVec, IntGaugeVec, Opts, TextEncoder, register_int_counter_vec,
    register_int_gauge_vec,
};
use sitekeeper_common::fsutil::{MODE_PUBLIC, write_atomic};
use std::path::Path;
use std::sync::OnceLock;

const METRIC_PREFIX: &str = "sitekeeper";

/// Metrics 注册结果，可能包含注册错误
type MetricRegistration<T> = Result<T, prometheus::Error>;

fn operations_total() -> &'static MetricRegistration<IntCounterVec> {
    static METRIC: OnceLock<MetricRegistration<IntCounterVec>> = OnceLock::new();
    METRIC.get_or_init(|| {
        register_int_counter_vec!(
            Opts::new(format!("{METRIC_PREFIX}_operations_total"), "执行的操作总数"),
            &["operation", "result"]
        )
    })
}

fn certificate_not_after_seconds() -> &'static MetricRegistration<IntGaugeVec> {
    static METRIC: OnceLock<MetricRegistration<IntGaugeVec>> = OnceLock::new();
    METRIC.get_or_init(|| {
        register_int_gauge_vec!(
            Opts::new(
                format!("{METRIC_PREFIX}_certificate_not_after_seconds"),
                "证书到期时间（Unix 秒）"
            ),
            &["domain"]
        )
    })
}

pub fn record_operation(operation: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    if let Ok(counter) = operations_total() {
        counter.with_label_values(&[operation, result]).inc();
    }
}

pub fn observe_certificate(domain: &str, not_after: i64) {
    if let Ok(gauge) = certificate_not_after_seconds() {
        gauge.with_label_values(&[domain]).set(not_after);
    }
}

pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

/// 写出供 node-exporter textfile collector 读取的指标文件
pub fn write_textfile(path: &Path) -> anyhow::Result<()> {
    let buffer = render()?;
    write_atomic(path, &buffer, MODE_PUBLIC)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textfile_contains_recorded_metrics() {
        record_operation("add", true);
        observe_certificate("metrics.example.test", 1_900_000_000);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sitekeeper.prom");
        write_textfile(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(r#"sitekeeper_operations_total{operation="add",result="success"}"#));
        assert!(text.contains(
            r#"sitekeeper_certificate_not_after_seconds{domain="metrics.example.test"} 1900000000"#
        ));
    }
}
