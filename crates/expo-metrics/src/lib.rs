use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::runtime::Handle;
use tracing::{info, warn};

pub const FEEDBACK_SUBMITTED_TOTAL: &str = "expo_feedback_submitted_total";
pub const FEEDBACK_REJECTED_TOTAL: &str = "expo_feedback_rejected_total";
pub const FEEDBACK_STORE_ERRORS_TOTAL: &str = "expo_feedback_store_errors_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Start a Prometheus exporter on `0.0.0.0:<port>`.
///
/// Must be called from inside a tokio runtime; the HTTP listener runs as a
/// task on it. Port `0` leaves the exporter off and counters recorded without
/// an installed recorder are dropped. Calling this twice returns the first
/// handle.
pub fn init_metrics(port: u16) -> Option<&'static PrometheusHandle> {
    if port == 0 {
        info!("metrics exporter disabled");
        return None;
    }

    if let Some(existing) = PROMETHEUS_HANDLE.get() {
        return Some(existing);
    }

    let Ok(runtime) = Handle::try_current() else {
        warn!(metrics_port = port, "no tokio runtime; prometheus exporter not started");
        return None;
    };

    let (recorder, exporter) = match PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .build()
    {
        Ok(parts) => parts,
        Err(err) => {
            warn!(error = %err, metrics_port = port, "failed to build prometheus exporter");
            return None;
        }
    };

    let handle = recorder.handle();
    if let Err(err) = metrics::set_global_recorder(recorder) {
        warn!(error = %err, metrics_port = port, "metrics recorder already installed");
        return None;
    }

    runtime.spawn(async move {
        if let Err(err) = exporter.await {
            warn!(error = ?err, metrics_port = port, "prometheus exporter stopped");
        }
    });

    let _ = PROMETHEUS_HANDLE.set(handle);
    info!(metrics_port = port, "started prometheus exporter");
    PROMETHEUS_HANDLE.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn zero_port_disables_exporter() {
        assert!(init_metrics(0).is_none());
    }

    async fn scrape(port: u16) -> String {
        for _ in 0..50 {
            if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
                stream
                    .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .await
                    .unwrap();
                let mut body = String::new();
                stream.read_to_string(&mut body).await.unwrap();
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("exporter never listened on port {port}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exporter_serves_recorded_counters() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        assert!(init_metrics(port).is_some());
        metrics::counter!(FEEDBACK_SUBMITTED_TOTAL).increment(1);

        let body = scrape(port).await;
        assert!(body.starts_with("HTTP/1.1 200"), "{body}");
        assert!(body.contains(FEEDBACK_SUBMITTED_TOTAL), "{body}");
    }
}
