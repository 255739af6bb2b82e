//! Application context: builds every component in dependency order and tears
//! them down in reverse.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};

use crate::analysis::{AnalysisError, AnalysisLoop, AnalysisSettings, DerivedState, Picker};
use crate::capture::{self, CaptureBackend, CaptureError};
use crate::http::{self, HttpState};
use crate::params::{ParamName, ParamStore};
use crate::pipeline::{FrameProvider, ProviderConfig, ProviderError};
use crate::publish::{EventEmitter, PolledVariable, ServerError, StateReporter, VariableServer};
use crate::utils::choose_stream_resolution;
use crate::Config;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("analysis thread panicked")]
    AnalysisPanicked,
    #[cfg(feature = "v4l2")]
    #[error(transparent)]
    NoDevice(#[from] crate::utils::NoDevice),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct App {
    params: Arc<ParamStore>,
    backend: Arc<dyn CaptureBackend>,
    provider: Arc<FrameProvider>,
    server: Arc<VariableServer>,
    port_watcher: tokio::task::JoinHandle<()>,
    events: Arc<EventEmitter>,
    analysis: JoinHandle<Result<(), AnalysisError>>,
    analysis_done: flume::Receiver<()>,
    derived: Arc<DerivedState>,
    picker: Picker,
    http_addr: SocketAddr,
    http_shutdown: oneshot::Sender<()>,
    http_task: tokio::task::JoinHandle<io::Result<()>>,
}

impl App {
    #[instrument(skip_all)]
    pub async fn start(config: Config) -> Result<Self, AppError> {
        let params = Arc::new(ParamStore::new(config.params.clone()));

        #[allow(unused_mut)]
        let mut capture_config = config.capture.clone();
        #[cfg(feature = "v4l2")]
        if capture_config.backend == capture::BackendKind::V4l2 && capture_config.device.is_none() {
            use_detected_device(&mut capture_config, crate::utils::auto_detect_device()?);
        }

        let available = capture::probe_resolutions(&capture_config).unwrap_or_else(|e| {
            warn!("Could not query stream resolutions: {}", e);
            Vec::new()
        });
        let resolution = choose_stream_resolution(capture_config.requested_resolution(), &available);
        params.report_resolution(resolution);

        let backend = capture::open_backend(&capture_config, resolution)?;
        let provider = Arc::new(FrameProvider::new(
            Arc::clone(&backend),
            ProviderConfig {
                buffer_count: capture_config.buffer_count,
                retention: config.pipeline.retention,
            },
        ));
        provider.start()?;

        let variable = Arc::new(PolledVariable::new(false, config.opcua.refresh_interval()));
        let server = Arc::new(
            VariableServer::new(config.opcua.host.clone(), Arc::clone(&variable))
                .with_pki_dir(config.opcua.pki_dir.clone()),
        );
        server.launch(params.snapshot().port)?;
        let port_watcher = spawn_port_watcher(&params, Arc::clone(&server));

        let events = Arc::new(EventEmitter::declare());

        let (analysis, picker) = AnalysisLoop::new(
            Arc::clone(&provider),
            Arc::clone(&params),
            StateReporter::new(variable, Arc::clone(&events)),
            AnalysisSettings {
                pick_timeout: config.analysis.pick_timeout(),
                debug_dir: config.analysis.debug_dir.clone(),
            },
        );
        let derived = analysis.derived_state();
        let (done_tx, analysis_done) = flume::bounded(1);
        let analysis = thread::Builder::new()
            .name("analysis".into())
            .spawn(move || {
                let result = analysis.run();
                let _ = done_tx.send(());
                result
            })?;

        let listener = tokio::net::TcpListener::bind(&config.http.bind).await?;
        let http_addr = listener.local_addr()?;
        let (http_shutdown, shutdown_rx) = oneshot::channel();
        let http_task = tokio::spawn(http::serve(
            listener,
            HttpState {
                derived: Arc::clone(&derived),
                picker: picker.clone(),
                params: Arc::clone(&params),
            },
            async {
                let _ = shutdown_rx.await;
            },
        ));

        info!("Color checker running");
        Ok(Self {
            params,
            backend,
            provider,
            server,
            port_watcher,
            events,
            analysis,
            analysis_done,
            derived,
            picker,
            http_addr,
            http_shutdown,
            http_task,
        })
    }

    pub fn params(&self) -> &Arc<ParamStore> {
        &self.params
    }

    pub fn provider(&self) -> &Arc<FrameProvider> {
        &self.provider
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    pub fn variable_server(&self) -> &Arc<VariableServer> {
        &self.server
    }

    pub fn derived_state(&self) -> &Arc<DerivedState> {
        &self.derived
    }

    pub fn picker(&self) -> &Picker {
        &self.picker
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Resolves when the analysis loop has exited on its own.
    pub async fn analysis_stopped(&self) {
        let _ = self.analysis_done.recv_async().await;
    }

    /// Stop everything in reverse order of construction.
    pub async fn shutdown(self) -> Result<(), AppError> {
        info!("Shutting down");
        let _ = self.http_shutdown.send(());
        match self.http_task.await {
            Ok(Err(e)) => warn!("HTTP server error: {}", e),
            Err(e) => warn!("HTTP task failed: {}", e),
            Ok(Ok(())) => {}
        }

        // Closing the stream unblocks the fetcher; the analysis loop then
        // sees no more frames and returns.
        self.provider.stop()?;
        let analysis = tokio::task::spawn_blocking(move || self.analysis.join())
            .await
            .map_err(|e| AppError::Io(io::Error::other(e)))?;
        let analysis_result = match analysis {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::AnalysisPanicked),
        };

        self.port_watcher.abort();
        let server = Arc::clone(&self.server);
        match tokio::task::spawn_blocking(move || server.shutdown()).await {
            Ok(Ok(())) | Ok(Err(ServerError::NotRunning)) => {}
            Ok(Err(e)) => warn!("Variable server shutdown failed: {}", e),
            Err(e) => warn!("Variable server shutdown task failed: {}", e),
        }

        drop(self.events);
        self.backend.close();
        info!("Shutdown complete");
        analysis_result
    }
}

/// The stream opens in the format the device was detected with.
#[cfg(feature = "v4l2")]
fn use_detected_device(capture: &mut crate::CaptureConfig, found: crate::utils::FoundDevice) {
    info!("Using capture device {} ({:?})", found.path, found.format);
    capture.device = Some(found.path);
    capture.format = found.format;
}

fn spawn_port_watcher(
    params: &ParamStore,
    server: Arc<VariableServer>,
) -> tokio::task::JoinHandle<()> {
    let changes = params.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv_async().await {
            if change.name != ParamName::Port {
                continue;
            }
            // Validated to 1024..=65535 by the store
            let port = change.value as u16;
            let server = Arc::clone(&server);
            match tokio::task::spawn_blocking(move || server.restart(port)).await {
                Ok(Ok(addr)) => info!("Variable server moved to {}", addr),
                Ok(Err(e)) => error!("Variable server restart on port {} failed: {}", port, e),
                Err(e) => error!("Variable server restart task failed: {}", e),
            }
        }
    })
}
