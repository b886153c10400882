use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

lazy_static! {
    pub static ref OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "cryo_operations_total",
        "Checkpoint/restore operations by kind and outcome",
        &["operation", "result"]
    )
    .unwrap();
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "cryo_operation_duration_seconds",
        "Time taken by dump, restore and run operations",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
}

/// Records one finished operation.
pub fn observe<T, E>(operation: &str, result: &Result<T, E>, elapsed: std::time::Duration) {
    let outcome = if result.is_ok() { "success" } else { "error" };
    OPERATIONS.with_label_values(&[operation, outcome]).inc();
    OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

/// Start the metrics server in a background task.
pub fn start_metrics_server(port: u16) {
    // Force initialization of metrics
    lazy_static::initialize(&OPERATIONS);
    lazy_static::initialize(&OPERATION_DURATION);

    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!("Metrics server starting on {}", addr);
                loop {
                    if let Ok((mut socket, _)) = listener.accept().await {
                        tokio::spawn(async move {
                            let body = metrics_handler();
                            let response = format!(
                                "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.flush().await;
                        });
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to bind metrics server: {}", e);
            }
        }
    });
}

fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_observe_counts_outcomes() {
        let before = OPERATIONS.with_label_values(&["test-op", "error"]).get();
        observe::<(), &str>("test-op", &Err("boom"), Duration::from_millis(5));
        assert_eq!(
            OPERATIONS.with_label_values(&["test-op", "error"]).get(),
            before + 1
        );
        assert!(metrics_handler().contains("cryo_operations_total"));
    }
}
