//! Pictor gRPC Image Generation Server
//!
//! ## Usage
//!
//! ```bash
//! # Serve models from a directory (port 7859)
//! pictor-server /srv/models --tls-cert cert.pem --tls-key key.pem
//!
//! # Plaintext, with a shared secret and response compression
//! pictor-server /srv/models --no-tls --shared-secret s3cret --response-compression
//!
//! # Fetch uploaded LoRAs from R2 into a secondary directory
//! pictor-server /srv/models --secondary-models-dir /srv/custom \
//!     --blob-store-endpoint https://<account>.r2.cloudflarestorage.com \
//!     --blob-store-bucket loras --blob-store-access-key AK --blob-store-secret SK
//!
//! # Abort if a cancelled request is still running 30s + 60s later
//! pictor-server /srv/models --cancellation-warning-timeout 30 --cancellation-crash-timeout 60
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pictor_core::{
    CancelAction, CancellationMonitor, GenerationInput, GenerationOutput, GeneratorError,
    ImageGenerator, ProgressEvent,
};
use pictor_grpc::proto::image_generation_service_server::ImageGenerationServiceServer;
use pictor_grpc::{ImageGenerationServiceImpl, ServerConfig};
use pictor_network::ObjectStoreClient;
use pictor_rewriter::LoraLoader;

#[derive(Parser, Debug)]
#[command(name = "pictor-server")]
#[command(author = "Daemoniorum LLC")]
#[command(version)]
#[command(about = "Pictor gRPC Image Generation Server", long_about = None)]
struct Args {
    /// Directory models are read from and uploaded to
    models_dir: Option<PathBuf>,

    /// Additional model directory; downloaded LoRAs land here
    #[arg(long)]
    secondary_models_dir: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Secret every request must carry
    #[arg(long, env = "PICTOR_SHARED_SECRET")]
    shared_secret: Option<String>,

    /// Serve plaintext gRPC
    #[arg(long)]
    no_tls: bool,

    /// Path to TLS certificate
    #[arg(long)]
    tls_cert: Option<String>,

    /// Path to TLS key
    #[arg(long)]
    tls_key: Option<String>,

    /// Path to client CA certificate (for mTLS)
    #[arg(long)]
    tls_client_ca: Option<String>,

    /// Require client certificates (mTLS)
    #[arg(long)]
    tls_require_client_cert: bool,

    /// Compress generated tensors and previews
    #[arg(long)]
    response_compression: bool,

    /// Let echo list available models
    #[arg(long)]
    model_browsing: bool,

    /// Build echo replies on the active worker lane
    #[arg(long)]
    echo_on_queue: bool,

    /// Route work to the backup lane
    #[arg(long)]
    use_backup_queue: bool,

    /// Object storage access key id
    #[arg(long)]
    blob_store_access_key: Option<String>,

    /// Object storage secret access key
    #[arg(long, env = "PICTOR_BLOB_STORE_SECRET")]
    blob_store_secret: Option<String>,

    /// Object storage endpoint
    #[arg(long)]
    blob_store_endpoint: Option<String>,

    /// Bucket holding uploaded LoRAs
    #[arg(long)]
    blob_store_bucket: Option<String>,

    /// Seconds a cancelled request may run before a warning
    #[arg(long)]
    cancellation_warning_timeout: Option<u64>,

    /// Further seconds before the process is terminated
    #[arg(long)]
    cancellation_crash_timeout: Option<u64>,

    /// Only log when a cancelled request never returns
    #[arg(long)]
    no_cancellation_crash: bool,

    /// Maximum message size in MB
    #[arg(long)]
    max_message_size_mb: Option<usize>,

    /// Enable Prometheus metrics
    #[arg(long)]
    metrics: bool,

    /// Metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Layer command-line values over the configuration file
    fn apply(self, config: &mut ServerConfig) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }
        fn set_opt<T>(target: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *target = value;
            }
        }

        set(&mut config.models_dir, self.models_dir);
        set_opt(&mut config.secondary_models_dir, self.secondary_models_dir);
        set(&mut config.host, self.host);
        set(&mut config.port, self.port);
        set_opt(&mut config.shared_secret, self.shared_secret);
        set_opt(&mut config.tls_cert, self.tls_cert);
        set_opt(&mut config.tls_key, self.tls_key);
        set_opt(&mut config.tls_client_ca, self.tls_client_ca);
        set_opt(&mut config.blob_store_access_key, self.blob_store_access_key);
        set_opt(&mut config.blob_store_secret, self.blob_store_secret);
        set_opt(&mut config.blob_store_endpoint, self.blob_store_endpoint);
        set_opt(&mut config.blob_store_bucket, self.blob_store_bucket);
        set_opt(
            &mut config.cancellation_warning_timeout_secs,
            self.cancellation_warning_timeout,
        );
        set_opt(
            &mut config.cancellation_crash_timeout_secs,
            self.cancellation_crash_timeout,
        );
        set(
            &mut config.max_message_size,
            self.max_message_size_mb.map(|mb| mb * 1024 * 1024),
        );
        set(&mut config.metrics_port, self.metrics_port);
        set(&mut config.log_level, self.log_level);

        config.tls_enabled &= !self.no_tls;
        config.tls_require_client_cert |= self.tls_require_client_cert;
        config.response_compression |= self.response_compression;
        config.model_browsing |= self.model_browsing;
        config.echo_on_queue |= self.echo_on_queue;
        config.uses_backup_queue |= self.use_backup_queue;
        config.cancellation_crash &= !self.no_cancellation_crash;
        config.metrics_enabled |= self.metrics;
    }
}

/// Stands in for the compute collaborator when none is linked in
struct NoComputeBackend;

impl ImageGenerator for NoComputeBackend {
    fn generate(
        &self,
        _input: GenerationInput,
        _cancellation: &dyn Fn(CancelAction),
        _feedback: &mut dyn FnMut(ProgressEvent) -> bool,
    ) -> Result<GenerationOutput, GeneratorError> {
        Err(GeneratorError::Failed(
            "no compute backend is linked into this server".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);

    // Initialize logging
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize metrics if enabled
    if config.metrics_enabled {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        info!("Starting Prometheus metrics server on {}", metrics_addr);

        tokio::spawn(async move {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            if let Err(e) = builder.with_http_listener(metrics_addr).install() {
                warn!("Failed to install Prometheus recorder: {}", e);
            }
        });
    }

    let monitor = config.cancellation_monitor();
    CancellationMonitor::set_global(monitor.clone());

    let mut builder =
        ImageGenerationServiceImpl::builder(Arc::new(NoComputeBackend), config.model_store())
            .response_compression(config.response_compression)
            .model_browsing(config.model_browsing)
            .echo_on_queue(config.echo_on_queue);
    if let Some(ref secret) = config.shared_secret {
        builder = builder.shared_secret(secret.clone());
    }

    let lora_source = match (config.object_store_config(), config.lora_store()) {
        (Some(object_store), Some(lora_store)) => {
            let source = format!("{}/{}", object_store.endpoint, object_store.bucket);
            let client = ObjectStoreClient::new(object_store)?;
            builder = builder.rewriter(Arc::new(LoraLoader::new(client, lora_store)));
            Some(source)
        }
        _ => None,
    };

    let service = builder.build()?;
    service.lanes().set_uses_backup(config.uses_backup_queue);

    let max_message_size = config.max_message_size;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let tls = config.build_tls_config().transpose()?;

    info!("Starting Pictor gRPC server...");
    info!("  Address:          {}", addr);
    info!("  Models:           {}", config.models_dir.display());
    if let Some(ref secondary) = config.secondary_models_dir {
        info!("  Custom models:    {}", secondary.display());
    }
    info!("  Max message size: {} MB", max_message_size / (1024 * 1024));
    info!(
        "  TLS:              {}",
        if tls.is_some() { "enabled" } else { "disabled" }
    );
    info!(
        "  Shared secret:    {}",
        if config.shared_secret.is_some() { "required" } else { "none" }
    );
    info!(
        "  LoRA downloads:   {}",
        lora_source.as_deref().unwrap_or("disabled")
    );
    info!(
        "  Cancel watchdog:  {}",
        match monitor {
            Some(ref m) if m.terminate => "terminate",
            Some(_) => "log only",
            None => "disabled",
        }
    );
    info!(
        "  Metrics:          {}",
        if config.metrics_enabled {
            format!("port {}", config.metrics_port)
        } else {
            "disabled".to_string()
        }
    );
    warn!("No compute backend is linked in; generation requests will fail");
    if config.tls_enabled && tls.is_none() {
        warn!("TLS requested but no certificate/key configured; serving plaintext");
    }
    info!("Ready to accept connections!");

    let grpc_service = ImageGenerationServiceServer::new(service)
        .max_decoding_message_size(max_message_size)
        .max_encoding_message_size(max_message_size);

    match tls {
        Some(tls_config) => {
            if tls_config.is_mtls() {
                info!(
                    required = tls_config.requires_client_cert(),
                    "Client certificate verification enabled"
                );
            }
            Server::builder()
                .tls_config(tls_config.to_server_tls_config())?
                .add_service(grpc_service)
                .serve(addr)
                .await?;
        }
        None => {
            Server::builder()
                .add_service(grpc_service)
                .serve(addr)
                .await?;
        }
    }

    Ok(())
}
