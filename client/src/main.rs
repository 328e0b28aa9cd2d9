mod audio;
mod classifier;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anc_engine::{
    AudioInput, AudioOutput, Collaborators, InMemoryFilterStore, MetricsSink, NotifierHandle,
    PipelineOrchestrator, PipelineState, TimedClassifier, TracingMetricsSink, TracingSink,
};
use anc_metrics::{MetricsConfig, MetricsServer, PrometheusSink};
use anyhow::{Context, Result};
use clap::Parser;
use classifier::ToneAlarmClassifier;
use config::Config;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use audio::synthetic::{NullOutput, SyntheticInput};

const STATE_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();
    let session = cfg.session()?;
    info!(
        session = %session.session_id,
        algorithm = session.filter.kind().as_str(),
        order = session.filter.order(),
        desired = %session.desired_source,
        "configured"
    );

    let metrics_sink: Arc<dyn MetricsSink> = if cfg.no_metrics {
        Arc::new(TracingMetricsSink)
    } else {
        let server = MetricsServer::install(MetricsConfig {
            listen: cfg.metrics_listen.clone(),
            namespace: cfg.metrics_namespace.clone(),
        })
        .context("installing metrics recorder")?;
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!(error = %e, "metrics server exited");
            }
        });
        Arc::new(PrometheusSink::new(cfg.metrics_namespace.clone()))
    };

    let events = Arc::new(
        NotifierHandle::spawn(Arc::new(TracingSink), cfg.notify_capacity)
            .context("starting notifier")?,
    );
    let classifier = Arc::new(
        TimedClassifier::new(Arc::new(ToneAlarmClassifier::default()), cfg.classifier_timeout())
            .context("starting classifier")?,
    );
    let (input, output) = audio_io(&cfg);

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        cfg.pipeline(),
        session,
        cfg.gate(),
        Collaborators {
            input,
            output,
            classifier,
            store: Arc::new(InMemoryFilterStore::new(cfg.store())),
            events,
            metrics_sink,
        },
    )?);
    orchestrator.start().context("pipeline failed to start")?;

    let mut poll = tokio::time::interval(STATE_POLL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = poll.tick() => {
                let state = orchestrator.state();
                if state != PipelineState::Running {
                    warn!(%state, "pipeline left running state");
                    break;
                }
            }
        }
    }

    // stop() joins worker threads; keep it off the runtime
    let orch = orchestrator.clone();
    tokio::task::spawn_blocking(move || orch.stop())
        .await
        .context("stop task panicked")??;

    let snap = orchestrator.snapshot();
    info!(
        chunks = snap.chunks_processed,
        bypassed = snap.bypass_count,
        overflows = snap.queue_overflow_count,
        deadline_misses = snap.deadline_miss_count,
        p50_us = snap.p50_latency_us,
        p95_us = snap.p95_latency_us,
        max_us = snap.max_latency_us,
        "pipeline stopped"
    );
    Ok(())
}

type AudioIo = (Arc<dyn AudioInput>, Arc<dyn AudioOutput>);

#[cfg(feature = "device")]
fn device_io(cfg: &Config) -> Option<AudioIo> {
    cfg.device.then(|| {
        info!("using default audio devices");
        let io: AudioIo = (
            Arc::new(audio::capture::DeviceInput::new()),
            Arc::new(audio::playout::DeviceOutput::new()),
        );
        io
    })
}

#[cfg(not(feature = "device"))]
fn device_io(_cfg: &Config) -> Option<AudioIo> {
    None
}

fn audio_io(cfg: &Config) -> AudioIo {
    if let Some(io) = device_io(cfg) {
        return io;
    }

    info!(source = ?cfg.source, "using synthetic audio");
    let input = SyntheticInput::new(cfg.source, cfg.seed)
        .with_alarm_every(Duration::from_secs_f64(cfg.alarm_every_secs.max(0.0)))
        .with_limit(cfg.duration_chunks());
    (Arc::new(input), Arc::new(NullOutput::new()))
}
