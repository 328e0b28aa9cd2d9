use anc_dsp::{AlgorithmKind, FilterConfig};
use anc_engine::{
    CachedFilterStore, ChunkRequest, DesiredSource, EmergencyVerdict, FlakyCache, GateConfig,
    MemoryCache, NullPublisher, OnClassifierFailure, SessionConfig, SessionFilterStore, SessionId,
    StatelessHandler, StoreConfig,
};
use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

mod stats;

use stats::{dur_us, quantiles_us, Counters, SoakReport, WorkerStats};

#[derive(Parser, Debug, Clone)]
#[command(name = "anc-soak", about = "Stateless per-chunk soak tester")]
struct Args {
    /// Distinct sessions the workers spread chunks across
    #[arg(long, default_value_t = 32)]
    sessions: usize,

    /// Number of concurrent workers
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Chunks per worker
    #[arg(long, default_value_t = 500)]
    iterations: u64,

    /// Run for duration seconds (overrides iterations if set)
    #[arg(long)]
    duration_secs: Option<u64>,

    #[arg(long, default_value_t = 1_024)]
    chunk_size: usize,

    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,

    /// lms, nlms, rls or hybrid
    #[arg(long, default_value = "nlms")]
    algorithm: AlgorithmKind,

    #[arg(long, default_value_t = 64)]
    order: usize,

    /// Probability that a chunk carries an emergency verdict
    #[arg(long, default_value_t = 0.05)]
    emergency_prob: f64,

    /// Probability that a chunk arrives without any verdict (classifier down)
    #[arg(long, default_value_t = 0.01)]
    missing_verdict_prob: f64,

    /// bypass or cancel
    #[arg(long, default_value = "bypass")]
    on_classifier_failure: OnClassifierFailure,

    /// Fail one in N cache calls (0 disables)
    #[arg(long, default_value_t = 0)]
    cache_fail_one_in: u64,

    /// Probability that a worker ends its session after a chunk
    #[arg(long, default_value_t = 0.001)]
    end_session_prob: f64,

    /// Real-time budget per chunk
    #[arg(long, default_value_t = 10)]
    budget_ms: u64,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Write JSON report to this path
    #[arg(long)]
    report_json: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let args = Args::parse();
    let filter = FilterConfig::with_kind(args.order, args.algorithm).context("invalid filter")?;

    let cache =
        Arc::new(FlakyCache::new(MemoryCache::new()).with_failure_rate(args.cache_fail_one_in));
    let store = Arc::new(CachedFilterStore::new(cache.clone(), StoreConfig::default()));
    let handler = Arc::new(
        StatelessHandler::new(
            store.clone(),
            GateConfig {
                on_classifier_failure: args.on_classifier_failure,
                ..GateConfig::default()
            },
            None,
            Arc::new(NullPublisher),
        )
        .with_deadline(Duration::from_millis(args.budget_ms)),
    );

    let sessions: Arc<Vec<SessionConfig>> = Arc::new(
        (0..args.sessions.max(1))
            .map(|i| {
                let id = SessionId::from(format!("soak-{i}"));
                let mut s = SessionConfig::new(id, filter.clone());
                s.sample_rate = args.sample_rate;
                s.desired_source = DesiredSource::Observed;
                s
            })
            .collect(),
    );

    let stop_at = args.duration_secs.map(|s| Instant::now() + Duration::from_secs(s));
    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();
    info!(
        workers = args.concurrency,
        sessions = sessions.len(),
        algorithm = args.algorithm.as_str(),
        order = args.order,
        "soak starting"
    );

    let mut handles = vec![];
    for worker_id in 0..args.concurrency {
        let args = args.clone();
        let handler = handler.clone();
        let sessions = sessions.clone();
        let stop = stop.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            worker_loop(worker_id, &args, &handler, &sessions, stop_at, &stop)
        }));
    }

    let mut all = WorkerStats::default();
    let join_all = async {
        let mut out = vec![];
        for h in handles {
            out.push(h.await);
        }
        out
    };
    tokio::pin!(join_all);

    let results = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received; stopping");
            stop.store(true, Ordering::Relaxed);
            join_all.await
        }
        r = &mut join_all => r,
    };
    for r in results {
        match r {
            Ok(w) => {
                all.counters.merge(&w.counters);
                all.process_us.extend(w.process_us);
                all.roundtrip_us.extend(w.roundtrip_us);
            }
            Err(e) => warn!(error = %e, "worker panicked"),
        }
    }

    let mut rep = SoakReport {
        counters: all.counters,
        engine: handler.snapshot(),
        store: Some(store.stats()),
        injected_cache_failures: cache.injected_failures(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        ..SoakReport::default()
    };
    let (p50, p95, max) = quantiles_us(&mut all.process_us);
    rep.timings.process_us_p50 = p50;
    rep.timings.process_us_p95 = p95;
    rep.timings.process_us_max = max;
    let (p50, p95, max) = quantiles_us(&mut all.roundtrip_us);
    rep.timings.roundtrip_us_p50 = p50;
    rep.timings.roundtrip_us_p95 = p95;
    rep.timings.roundtrip_us_max = max;
    rep.timings.budget_us = args.budget_ms * 1_000;

    info!("report: {}", serde_json::to_string_pretty(&rep)?);

    if let Some(path) = args.report_json.as_deref() {
        std::fs::write(path, serde_json::to_vec_pretty(&rep)?)
            .with_context(|| format!("write {path}"))?;
        info!("wrote {}", path);
    }

    Ok(())
}

fn worker_loop(
    worker_id: usize,
    args: &Args,
    handler: &StatelessHandler,
    sessions: &[SessionConfig],
    stop_at: Option<Instant>,
    stop: &AtomicBool,
) -> WorkerStats {
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(worker_id as u64));
    let budget = Duration::from_millis(args.budget_ms);
    let mut stats = WorkerStats {
        counters: Counters::default(),
        process_us: Vec::with_capacity(args.iterations as usize),
        roundtrip_us: Vec::with_capacity(args.iterations as usize),
    };

    let mut iter: u64 = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match stop_at {
            Some(deadline) if Instant::now() >= deadline => break,
            Some(_) => {}
            None if iter >= args.iterations => break,
            None => {}
        }
        iter += 1;

        let session = &sessions[rng.gen_range(0..sessions.len())];
        let reference: Vec<f64> = (0..args.chunk_size).map(|_| rng.gen_range(-0.5..0.5)).collect();
        // error mic hears the reference through a short, attenuated path
        let observed: Vec<f64> = (0..reference.len())
            .map(|i| if i >= 4 { 0.7 * reference[i - 4] } else { 0.0 })
            .collect();
        let roll: f64 = rng.gen();
        let verdict = if roll < args.missing_verdict_prob {
            None
        } else if roll < args.missing_verdict_prob + args.emergency_prob {
            Some(EmergencyVerdict::emergency("siren", rng.gen_range(0.5..1.0)))
        } else {
            Some(EmergencyVerdict::clear())
        };

        let t0 = Instant::now();
        let resp = handler.handle(ChunkRequest {
            session: session.clone(),
            seq: iter,
            reference,
            observed: Some(observed),
            verdict,
        });
        let roundtrip = t0.elapsed();

        stats.counters.record(resp.mode);
        if roundtrip > budget {
            stats.counters.over_budget += 1;
        }
        stats.process_us.push(dur_us(resp.latency));
        stats.roundtrip_us.push(dur_us(roundtrip));

        if rng.gen_bool(args.end_session_prob.clamp(0.0, 1.0)) {
            match handler.end_session(&session.session_id) {
                Ok(()) => stats.counters.sessions_ended += 1,
                Err(e) => {
                    stats.counters.end_session_err += 1;
                    warn!("[w{}] end session {}: {}", worker_id, session.session_id, e);
                }
            }
        }
    }
    stats
}
