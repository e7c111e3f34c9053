//! gRPC service implementation for image generation.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use pictor_core::{
    CancellationMonitor, ImageGenerator, MetadataOverrides, ModelStore, Specification,
    WorkerLanes,
};
use pictor_rewriter::ConfigurationRewriter;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::convert::overrides_to_proto;
use crate::delegate::{DelegateDispatcher, GenerationServiceDelegate};
use crate::error::ServiceError;
use crate::handler::{GenerationRequestHandler, RESPONSE_BUFFER};
use crate::metrics;
use crate::options::ServiceOptions;
use crate::proto::image_generation_service_server::ImageGenerationService;
use crate::proto::*;
use crate::upload::{is_valid_filename, receive_upload};

/// Image generation service implementation
pub struct ImageGenerationServiceImpl {
    handler: Arc<GenerationRequestHandler>,
    lanes: Arc<WorkerLanes>,
    store: ModelStore,
    options: Arc<ServiceOptions>,
    catalog: Arc<MetadataOverrides>,
}

impl ImageGenerationServiceImpl {
    /// Start configuring a service around a compute collaborator
    pub fn builder(generator: Arc<dyn ImageGenerator>, store: ModelStore) -> ServiceBuilder {
        ServiceBuilder::new(generator, store)
    }

    /// Runtime switches
    pub fn options(&self) -> &Arc<ServiceOptions> {
        &self.options
    }

    /// Worker lanes; flip `set_uses_backup` to route new work
    pub fn lanes(&self) -> &Arc<WorkerLanes> {
        &self.lanes
    }

    /// Requests currently being generated
    pub fn in_flight(&self) -> usize {
        self.handler.in_flight()
    }

    fn echo_reply(store: &ModelStore, catalog: &MetadataOverrides, name: &str, browse: bool) -> EchoReply {
        let mut reply = EchoReply {
            message: format!("HELLO {}", name),
            ..Default::default()
        };
        if browse {
            reply.files = store.list_ckpt_files();
            reply.r#override = Some(overrides_to_proto(&available(store, catalog)));
        }
        reply
    }
}

/// Catalog entries whose files are present locally
fn available(store: &ModelStore, catalog: &MetadataOverrides) -> MetadataOverrides {
    let keep = |specs: &[Specification]| -> Vec<Specification> {
        let mut seen = HashSet::new();
        specs
            .iter()
            .filter(|spec| store.is_downloaded(&spec.file) && seen.insert(spec.file.clone()))
            .cloned()
            .collect()
    };
    MetadataOverrides {
        models: keep(&catalog.models),
        loras: keep(&catalog.loras),
        control_nets: keep(&catalog.control_nets),
        textual_inversions: keep(&catalog.textual_inversions),
        upscalers: keep(&catalog.upscalers),
    }
}

/// Builder for [`ImageGenerationServiceImpl`]
pub struct ServiceBuilder {
    generator: Arc<dyn ImageGenerator>,
    store: ModelStore,
    options: ServiceOptions,
    rewriter: Option<Arc<dyn ConfigurationRewriter>>,
    delegate: Option<Arc<dyn GenerationServiceDelegate>>,
    monitor: Option<Option<CancellationMonitor>>,
    lanes: Option<Arc<WorkerLanes>>,
    catalog: MetadataOverrides,
}

impl ServiceBuilder {
    fn new(generator: Arc<dyn ImageGenerator>, store: ModelStore) -> Self {
        Self {
            generator,
            store,
            options: ServiceOptions::new(),
            rewriter: None,
            delegate: None,
            monitor: None,
            lanes: None,
            catalog: MetadataOverrides::default(),
        }
    }

    /// Require a shared secret on every request
    pub fn shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.options = self.options.with_shared_secret(secret);
        self
    }

    /// Compress generated tensors and previews
    pub fn response_compression(self, enabled: bool) -> Self {
        self.options.set_response_compression(enabled);
        self
    }

    /// Let echo list the locally available models
    pub fn model_browsing(self, enabled: bool) -> Self {
        self.options.set_enable_model_browsing(enabled);
        self
    }

    /// Build echo replies on the active worker lane
    pub fn echo_on_queue(self, enabled: bool) -> Self {
        self.options.set_echo_on_queue(enabled);
        self
    }

    /// Resolve configurations before queueing
    pub fn rewriter(mut self, rewriter: Arc<dyn ConfigurationRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Report request lifecycle to an application delegate
    pub fn delegate(mut self, delegate: Arc<dyn GenerationServiceDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Override the process-wide cancellation monitor
    pub fn cancellation_monitor(mut self, monitor: Option<CancellationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Share worker lanes with other services
    pub fn lanes(mut self, lanes: Arc<WorkerLanes>) -> Self {
        self.lanes = Some(lanes);
        self
    }

    /// Specifications echo may advertise when their files are present
    pub fn catalog(mut self, catalog: MetadataOverrides) -> Self {
        self.catalog = catalog;
        self
    }

    /// Start worker lanes and the delegate thread as needed
    pub fn build(self) -> Result<ImageGenerationServiceImpl, ServiceError> {
        let lanes = match self.lanes {
            Some(lanes) => lanes,
            None => Arc::new(WorkerLanes::new()?),
        };
        let options = Arc::new(self.options);

        let mut handler = GenerationRequestHandler::new(
            self.generator,
            Arc::clone(&lanes),
            Arc::clone(&options),
        );
        if let Some(rewriter) = self.rewriter {
            handler = handler.with_rewriter(rewriter);
        }
        if let Some(delegate) = self.delegate {
            handler = handler.with_delegate(DelegateDispatcher::new(delegate)?);
        }
        if let Some(monitor) = self.monitor {
            handler = handler.with_monitor(monitor);
        }

        Ok(ImageGenerationServiceImpl {
            handler: Arc::new(handler),
            lanes,
            store: self.store,
            options,
            catalog: Arc::new(self.catalog),
        })
    }
}

#[tonic::async_trait]
impl ImageGenerationService for ImageGenerationServiceImpl {
    type GenerateImageStream = Pin<
        Box<dyn futures::Stream<Item = Result<ImageGenerationResponse, Status>> + Send>,
    >;

    async fn generate_image(
        &self,
        request: Request<ImageGenerationRequest>,
    ) -> Result<Response<Self::GenerateImageStream>, Status> {
        metrics::record_request("generate_image");
        let req = request.into_inner();

        if let Err(e) = self.options.check_secret(req.shared_secret.as_deref()) {
            warn!("Rejected generation request: {}", e);
            metrics::record_error("generate_image", e.kind());
            return Err(e.into());
        }

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let _ = handler.handle(req, tx).await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn files_exist(
        &self,
        request: Request<FileListRequest>,
    ) -> Result<Response<FileExistenceResponse>, Status> {
        metrics::record_request("files_exist");
        let req = request.into_inner();
        self.options.check_secret(req.shared_secret.as_deref())?;

        let store = self.store.clone();
        let response = tokio::task::spawn_blocking(move || {
            let wanted: HashSet<&str> = req.files_with_hash.iter().map(String::as_str).collect();
            let mut response = FileExistenceResponse::default();
            for file in &req.files {
                let path = is_valid_filename(file).then(|| store.locate(file)).flatten();
                let hash = match path {
                    Some(ref path) if wanted.contains(file.as_str()) => {
                        pictor_core::sha256_file(path).unwrap_or_else(|e| {
                            warn!(file = %file, "Failed to hash file: {}", e);
                            String::new()
                        })
                    }
                    _ => String::new(),
                };
                response.existences.push(path.is_some());
                response.hashes.push(hash);
                response.files.push(file.clone());
            }
            response
        })
        .await
        .map_err(|e| Status::internal(format!("File check failed: {}", e)))?;

        debug!(files = response.files.len(), "Checked file existence");
        Ok(Response::new(response))
    }

    type UploadFileStream =
        Pin<Box<dyn futures::Stream<Item = Result<UploadResponse, Status>> + Send>>;

    async fn upload_file(
        &self,
        request: Request<Streaming<FileUploadRequest>>,
    ) -> Result<Response<Self::UploadFileStream>, Status> {
        metrics::record_request("upload_file");
        let stream = request.into_inner();
        let directory = self.store.primary_dir().to_path_buf();
        let options = Arc::clone(&self.options);

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        tokio::spawn(async move {
            if let Ok(committed) = receive_upload(&directory, &options, stream, tx).await {
                info!(files = committed, "Upload stream finished");
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoReply>, Status> {
        metrics::record_request("echo");
        let req = request.into_inner();

        if self.options.check_secret(req.shared_secret.as_deref()).is_err() {
            return Ok(Response::new(EchoReply {
                shared_secret_missing: true,
                ..Default::default()
            }));
        }

        let browse = self.options.enable_model_browsing();
        let reply = if self.options.echo_on_queue() {
            let store = self.store.clone();
            let catalog = Arc::clone(&self.catalog);
            let name = req.name;
            self.lanes
                .active()
                .submit(move || Self::echo_reply(&store, &catalog, &name, browse))
                .await
                .map_err(|e| Status::from(ServiceError::from(e)))?
        } else {
            Self::echo_reply(&self.store, &self.catalog, &req.name, browse)
        };

        Ok(Response::new(reply))
    }
}
