use std::{
    process,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use regioncache::{
    cache::{CacheConfig, EventQueue, InvalidationConsumer, RegionCache},
    config::{self, InvalidateArgs, SoakArgs},
    infra::{error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOAK_IDENTIFIER: &str = "soak";

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    telemetry::init(&settings.logging)?;
    info!(
        strategy = %settings.cache.strategy,
        regions = settings.cache.regions.len(),
        "Configuration loaded"
    );

    let command = cli_args
        .command
        .unwrap_or(config::Command::Soak(SoakArgs::default()));

    match command {
        config::Command::Soak(args) => run_soak(&settings.cache, args),
        config::Command::Invalidate(args) => run_invalidate(&settings.cache, args),
    }
}

fn build_cache(config: &CacheConfig) -> (Arc<RegionCache>, Arc<EventQueue>, InvalidationConsumer) {
    let cache = Arc::new(RegionCache::in_memory(config));
    let queue = Arc::new(EventQueue::new_with_limit(config.event_queue_limit));
    let consumer = InvalidationConsumer::new(config, cache.clone(), queue.clone());
    (cache, queue, consumer)
}

/// Every worker requests every key at once; each key should compute once per round.
fn run_soak(config: &CacheConfig, args: SoakArgs) -> Result<(), InfraError> {
    let (cache, queue, consumer) = build_cache(config);
    let computations = Arc::new(AtomicUsize::new(0));
    let threads = args.threads.max(1);
    let work = Duration::from_millis(args.work_ms);
    let started_at = Instant::now();

    for round in 0..args.rounds {
        let barrier = Arc::new(Barrier::new(threads));
        let handles = (0..threads)
            .map(|worker| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                let computations = computations.clone();
                let region = args.region.clone();
                let keys = args.keys;
                thread::Builder::new()
                    .name(format!("regioncache-soak-{worker}"))
                    .spawn(move || -> Result<(), InfraError> {
                        barrier.wait();
                        for index in 0..keys {
                            let key = format!("key-{index}");
                            let value = cache.get_or_add(
                                &key,
                                &region,
                                || {
                                    computations.fetch_add(1, Ordering::SeqCst);
                                    thread::sleep(work);
                                    format!("{key}@{round}")
                                },
                                &[SOAK_IDENTIFIER],
                            )?;
                            if value != format!("{key}@{round}") {
                                warn!(key = %key, value = %value, round, "Stale value observed");
                            }
                        }
                        Ok(())
                    })
                    .map_err(InfraError::from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (worker, handle) in handles.into_iter().enumerate() {
            handle
                .join()
                .map_err(|_| InfraError::worker(format!("regioncache-soak-{worker}")))??;
        }

        queue.publish(SOAK_IDENTIFIER);
        let summary = consumer.consume_all();
        info!(
            round,
            removed_keys = summary.removed_keys,
            "Soak round invalidated"
        );
    }

    let computed = computations.load(Ordering::SeqCst);
    let expected = args.keys * args.rounds;
    info!(
        strategy = %cache.strategy(),
        threads,
        keys = args.keys,
        rounds = args.rounds,
        computed,
        expected,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Soak complete"
    );
    if computed > expected {
        warn!(
            duplicates = computed - expected,
            "Some keys were computed more than once"
        );
    }
    Ok(())
}

/// Cache entries against one identifier, then drop them through the background consumer.
fn run_invalidate(config: &CacheConfig, args: InvalidateArgs) -> Result<(), InfraError> {
    let (cache, queue, consumer) = build_cache(config);
    let keys: Vec<String> = (0..args.entries).map(|index| format!("entry-{index}")).collect();

    for key in &keys {
        cache.store(key, "Page", key.clone(), &[args.identifier.as_str()])?;
    }
    info!(
        identifier = %args.identifier,
        entries = keys.len(),
        "Entries cached"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handle = Arc::new(consumer).spawn_periodic(config.auto_consume_interval(), stop.clone())?;

    queue.publish(args.identifier.as_str());
    stop.store(true, Ordering::Release);
    handle.thread().unpark();
    handle
        .join()
        .map_err(|_| InfraError::worker("regioncache-invalidation"))?;

    let mut remaining = 0;
    for key in &keys {
        if cache.try_get::<String>(key, "Page")?.is_some() {
            remaining += 1;
        }
    }
    info!(
        identifier = %args.identifier,
        remaining,
        "Invalidation applied"
    );
    Ok(())
}
