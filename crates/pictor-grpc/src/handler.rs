//! Generation request lifecycle.
//!
//! ```text
//! Received ──secret/config──> ResolvingConfiguration? ──> Queued ──> Running
//!                                      │                              │ progress*
//!                                      └──────────> Failed <──────────┤
//!                                                                     ├──> Completed
//!                                                                     └──> Cancelled
//! ```
//!
//! Messages are pushed into the response channel in the order they are
//! produced. The terminal status is the last item: an `Err` for failures,
//! nothing (end of stream) for completions and cancellations.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pictor_core::{
    CancelAction, CancellationController, CancellationMonitor, GenerationConfiguration,
    GenerationInput, GenerationOutput, ImageGenerator, ProgressEvent, WorkerLanes,
};
use pictor_rewriter::{ConfigurationRewriter, DownloadProgress};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::compression::encode_payload;
use crate::convert::{device_from_proto, download_message, generation_input, progress_message};
use crate::delegate::{DelegateDispatcher, RequestNotifier};
use crate::error::{Result, ServiceError};
use crate::metrics;
use crate::options::ServiceOptions;
use crate::proto::{ChunkState, ImageGenerationRequest, ImageGenerationResponse};

/// Largest piece of an artifact sent in one chunked message
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Responses buffered per request before producers wait
pub const RESPONSE_BUFFER: usize = 16;

/// Sender half of a generation response stream
pub type ResponseSender = mpsc::Sender<std::result::Result<ImageGenerationResponse, Status>>;

/// How an accepted request ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Artifacts were delivered
    Completed { images: usize },
    /// The request was cancelled; an empty final message was sent
    Cancelled,
}

/// Drives generation requests from receipt to terminal status
pub struct GenerationRequestHandler {
    generator: Arc<dyn ImageGenerator>,
    rewriter: Option<Arc<dyn ConfigurationRewriter>>,
    lanes: Arc<WorkerLanes>,
    options: Arc<ServiceOptions>,
    delegate: DelegateDispatcher,
    monitor: Option<CancellationMonitor>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
}

impl GenerationRequestHandler {
    /// Create a handler using the process-wide cancellation monitor
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        lanes: Arc<WorkerLanes>,
        options: Arc<ServiceOptions>,
    ) -> Self {
        Self {
            generator,
            rewriter: None,
            lanes,
            options,
            delegate: DelegateDispatcher::disabled(),
            monitor: CancellationMonitor::global(),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Resolve configurations through `rewriter` before queueing
    pub fn with_rewriter(mut self, rewriter: Arc<dyn ConfigurationRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Report request lifecycle to a delegate
    pub fn with_delegate(mut self, delegate: DelegateDispatcher) -> Self {
        self.delegate = delegate;
        self
    }

    /// Override the cancellation monitor for this handler's requests
    pub fn with_monitor(mut self, monitor: Option<CancellationMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Number of requests currently being handled
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run one request to completion, writing responses into `tx`.
    ///
    /// A failure status is also sent on `tx` as the final item.
    pub async fn handle(
        &self,
        request: ImageGenerationRequest,
        tx: ResponseSender,
    ) -> Result<Outcome> {
        let started = Instant::now();
        let result = self.run(request, &tx).await;

        let elapsed = started.elapsed();
        match result {
            Ok(Outcome::Completed { images }) => {
                metrics::record_generation("completed", images, elapsed);
            }
            Ok(Outcome::Cancelled) => metrics::record_generation("cancelled", 0, elapsed),
            Err(ref e) => {
                metrics::record_generation("failed", 0, elapsed);
                metrics::record_error("generate_image", e.kind());
            }
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Generation request failed: {}", e);
                let _ = tx.send(Err(e.to_status())).await;
                Err(e)
            }
        }
    }

    async fn run(&self, request: ImageGenerationRequest, tx: &ResponseSender) -> Result<Outcome> {
        self.options.check_secret(request.shared_secret.as_deref())?;
        let configuration = GenerationConfiguration::from_bytes(&request.configuration)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let controller =
            CancellationController::with_monitor(format!("generate-{}", id), self.monitor.clone());

        let _finished = watch_disconnect(tx.clone(), controller.clone()).drop_guard();
        let _in_flight = InFlight::enter(&self.in_flight);

        let result = self.accepted(request, configuration, &controller, tx).await;
        controller.mark_completed();
        result
    }

    async fn accepted(
        &self,
        request: ImageGenerationRequest,
        configuration: GenerationConfiguration,
        controller: &CancellationController,
        tx: &ResponseSender,
    ) -> Result<Outcome> {
        let chunked = request.chunked;
        let user = request.user.clone();
        let device = device_from_proto(request.device);
        let mut input = generation_input(request, configuration);
        let signposts = self.generator.expected_signposts(&input);

        info!(
            request = controller.label(),
            user = %user,
            model = input.configuration.model.as_deref().unwrap_or(""),
            steps = input.configuration.steps,
            loras = input.configuration.loras.len(),
            "Received generation request"
        );
        let notifier =
            self.delegate
                .request_received(controller.clone(), signposts, user, device);

        if let Some(ref rewriter) = self.rewriter {
            match self
                .resolve(rewriter.as_ref(), &input.configuration, controller, tx)
                .await
            {
                Ok(resolved) => input.configuration = resolved,
                Err(_) if controller.is_cancelled() => {
                    return self
                        .finish_cancelled(controller, notifier, input.scale_factor, tx)
                        .await;
                }
                Err(e) => {
                    notifier.complete(false);
                    return Err(e);
                }
            }
        }

        let scale_factor = input.scale_factor;
        let result = self
            .run_on_lane(input, controller, &notifier, tx)
            .await;

        if controller.is_cancelled() {
            if let Err(ref e) = result {
                debug!(request = controller.label(), "Ignoring error of cancelled request: {}", e);
            }
            return self
                .finish_cancelled(controller, notifier, scale_factor, tx)
                .await;
        }

        let output = match result {
            Ok(output) if output.images.is_empty() => {
                notifier.complete(false);
                return Err(ServiceError::EmptyResult);
            }
            Ok(output) => output,
            Err(e) => {
                notifier.complete(false);
                return Err(e);
            }
        };

        let images = output.images.len();
        self.send_results(output, chunked, tx).await;
        info!(request = controller.label(), images, "Generation completed");
        notifier.complete(true);
        Ok(Outcome::Completed { images })
    }

    async fn resolve(
        &self,
        rewriter: &dyn ConfigurationRewriter,
        configuration: &GenerationConfiguration,
        controller: &CancellationController,
        tx: &ResponseSender,
    ) -> Result<GenerationConfiguration> {
        let registrar = {
            let controller = controller.clone();
            move |action: CancelAction| controller.register(action)
        };
        let progress_tx = tx.clone();
        let mut finished_bytes = 0u64;
        let mut current = (usize::MAX, 0u64);
        let mut on_progress = |progress: DownloadProgress| {
            if progress.index != current.0 {
                finished_bytes += current.1;
            }
            current = (progress.index, progress.bytes_received);
            if progress_tx.try_send(Ok(download_message(&progress))).is_err() {
                debug!("Response buffer full, skipping download progress");
            }
        };

        let resolved = rewriter
            .rewrite(configuration, &mut on_progress, &registrar)
            .await;
        controller.clear();
        let downloaded = finished_bytes + current.1;
        if downloaded > 0 {
            metrics::record_download(downloaded);
        }
        Ok(resolved?)
    }

    async fn run_on_lane(
        &self,
        input: GenerationInput,
        controller: &CancellationController,
        notifier: &RequestNotifier,
        tx: &ResponseSender,
    ) -> Result<GenerationOutput> {
        let generator = Arc::clone(&self.generator);
        let controller = controller.clone();
        let progress = notifier.progress();
        let tx = tx.clone();
        let compress = self.options.response_compression();
        let lane = self.lanes.active();
        debug!(request = controller.label(), lane = lane.name(), "Queueing generation");

        let job = move || {
            if controller.is_cancelled() {
                return Ok(GenerationOutput::default());
            }
            let registrar = |action: CancelAction| controller.register(action);
            let mut feedback = |event: ProgressEvent| -> bool {
                if controller.is_cancelled() {
                    return false;
                }
                progress.notify(event.signpost, event.signposts.clone());
                let preview = event.preview.map(|p| encode_payload(p, compress));
                let message = progress_message(&event.signpost, &event.signposts, preview);
                if tx.blocking_send(Ok(message)).is_err() {
                    debug!(request = controller.label(), "Response stream closed");
                }
                !controller.is_cancelled()
            };
            let result = generator.generate(input, &registrar, &mut feedback);
            controller.clear();
            result
        };

        Ok(lane.submit(job).await??)
    }

    async fn finish_cancelled(
        &self,
        controller: &CancellationController,
        notifier: RequestNotifier,
        scale_factor: u32,
        tx: &ResponseSender,
    ) -> Result<Outcome> {
        info!(request = controller.label(), "Generation cancelled");
        let message = ImageGenerationResponse {
            scale_factor: Some(scale_factor as i32),
            chunk_state: ChunkState::LastChunk as i32,
            ..Default::default()
        };
        let _ = tx.send(Ok(message)).await;
        notifier.complete(false);
        Ok(Outcome::Cancelled)
    }

    async fn send_results(&self, output: GenerationOutput, chunked: bool, tx: &ResponseSender) {
        let compress = self.options.response_compression();
        let images: Vec<Vec<u8>> = output
            .images
            .into_iter()
            .map(|image| encode_payload(image, compress))
            .collect();
        let total: usize = images.iter().map(Vec::len).sum();
        let scale_factor = Some(output.scale_factor.max(1) as i32);

        let messages = if chunked && total > CHUNK_SIZE {
            chunk_messages(images, total, scale_factor)
        } else {
            vec![ImageGenerationResponse {
                generated_images: images,
                scale_factor,
                chunk_state: ChunkState::LastChunk as i32,
                ..Default::default()
            }]
        };
        metrics::record_response_bytes(total as u64, messages.len() > 1);

        for message in messages {
            if tx.send(Ok(message)).await.is_err() {
                debug!("Client went away while results were streaming");
                return;
            }
        }
    }
}

/// Split artifacts into a size summary followed by offset-ordered chunks
pub fn chunk_messages(
    images: Vec<Vec<u8>>,
    total: usize,
    scale_factor: Option<i32>,
) -> Vec<ImageGenerationResponse> {
    let mut messages = vec![ImageGenerationResponse {
        download_size: Some(total as i64),
        ..Default::default()
    }];
    for image in images {
        let count = image.len().div_ceil(CHUNK_SIZE).max(1);
        let mut pieces = image.chunks(CHUNK_SIZE);
        for index in 0..count {
            let piece = pieces.next().map(<[u8]>::to_vec).unwrap_or_default();
            let state = if index + 1 == count {
                ChunkState::LastChunk
            } else {
                ChunkState::MoreChunks
            };
            messages.push(ImageGenerationResponse {
                generated_images: vec![piece],
                scale_factor,
                chunk_state: state as i32,
                ..Default::default()
            });
        }
    }
    messages
}

/// Cancel the request once the client stops listening.
///
/// The returned token stops the watcher; drop its guard when the request ends.
fn watch_disconnect(tx: ResponseSender, controller: CancellationController) -> CancellationToken {
    let finished = CancellationToken::new();
    let stop = finished.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tx.closed() => {
                info!(request = controller.label(), "Client disconnected, cancelling");
                controller.cancel();
            }
            _ = stop.cancelled() => {}
        }
    });
    finished
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_in_flight(now);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_in_flight(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(messages: &[ImageGenerationResponse]) -> Vec<Vec<u8>> {
        let mut artifacts = Vec::new();
        let mut current = Vec::new();
        for message in messages.iter().filter(|m| m.download_size.is_none()) {
            for piece in &message.generated_images {
                current.extend_from_slice(piece);
            }
            if message.chunk_state == ChunkState::LastChunk as i32 {
                artifacts.push(std::mem::take(&mut current));
            }
        }
        artifacts
    }

    #[test]
    fn test_chunks_reassemble_to_original() {
        let big: Vec<u8> = (0..CHUNK_SIZE * 2 + 123).map(|i| (i % 251) as u8).collect();
        let small = vec![9u8; 10];
        let exact = vec![1u8; CHUNK_SIZE];
        let total = big.len() + small.len() + exact.len();

        let messages =
            chunk_messages(vec![big.clone(), small.clone(), exact.clone()], total, Some(1));

        assert_eq!(messages[0].download_size, Some(total as i64));
        // 3 pieces + 1 piece + 1 piece after the summary
        assert_eq!(messages.len(), 6);
        assert!(messages[1..]
            .iter()
            .all(|m| m.generated_images.len() == 1 && m.generated_images[0].len() <= CHUNK_SIZE));
        assert_eq!(reassemble(&messages), vec![big, small, exact]);
    }

    #[test]
    fn test_last_chunk_marker_per_artifact() {
        let image = vec![0u8; CHUNK_SIZE + 1];
        let messages = chunk_messages(vec![image], CHUNK_SIZE + 1, Some(2));
        assert_eq!(messages[1].chunk_state, ChunkState::MoreChunks as i32);
        assert_eq!(messages[2].chunk_state, ChunkState::LastChunk as i32);
        assert_eq!(messages[2].scale_factor, Some(2));
    }

    #[test]
    fn test_empty_artifact_still_gets_a_last_chunk() {
        let messages = chunk_messages(vec![Vec::new()], 0, Some(1));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].chunk_state, ChunkState::LastChunk as i32);
    }
}
