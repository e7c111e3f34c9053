//! Prometheus metrics for the image-generation service.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Record an incoming RPC
pub fn record_request(rpc: &'static str) {
    counter!("pictor_requests_total", "rpc" => rpc).increment(1);
}

/// Record the end of a generation request
pub fn record_generation(outcome: &'static str, images: usize, duration: Duration) {
    counter!("pictor_generations_total", "outcome" => outcome).increment(1);
    counter!("pictor_images_generated_total").increment(images as u64);
    histogram!("pictor_generation_duration_seconds").record(duration.as_secs_f64());
}

/// Record result bytes streamed to a client
pub fn record_response_bytes(bytes: u64, chunked: bool) {
    let mode = if chunked { "chunked" } else { "single" };
    counter!("pictor_response_bytes_total", "mode" => mode).increment(bytes);
}

/// Record a finished asset download
pub fn record_download(bytes: u64) {
    counter!("pictor_download_bytes_total").increment(bytes);
}

/// Record a finished upload
pub fn record_upload(bytes: u64, success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    counter!("pictor_uploads_total", "outcome" => outcome).increment(1);
    if success {
        counter!("pictor_upload_bytes_total").increment(bytes);
    }
}

/// Track requests currently in flight
pub fn set_in_flight(requests: usize) {
    gauge!("pictor_requests_in_flight").set(requests as f64);
}

/// Record an error
pub fn record_error(operation: &'static str, kind: &'static str) {
    counter!("pictor_errors_total", "operation" => operation, "kind" => kind).increment(1);
}
