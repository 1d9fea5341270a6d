// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of quill.
//
// quill is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// quill is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with quill.  If not, see
// <http://www.gnu.org/licenses/>.

//! # quilld
//!
//! The quill daemon.
//!
//! # Introduction
//!
//! quilld serves the quill site on its public address, and health checks, metrics & operator
//! requests on its private (by default, loopback) address. It runs in the foreground; logs go to
//! stdout unless a log file is configured. `SIGHUP` re-reads the configuration, re-connects to
//! the database & empties the page cache (& re-opens the log file, if any); `SIGTERM` shuts down
//! gracefully.

use std::{
    fmt::Display,
    fs::OpenOptions,
    future::IntoFuture,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration as StdDuration,
};

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Duration;
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use snafu::prelude::*;
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::{mpsc, Notify},
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    Layer, Registry,
};

use quill::{
    cache::InMemoryPageCache,
    config::{self, parse_config, ConfigV1},
    gauge_set, make_site_router,
    media::MediaStore,
    metrics::{self, check_metric_registrations, Instruments, Sort},
    quill::Quill,
    sqlite, templates,
};

/// The quilld application error type
///
/// Note that I do not derive the [Debug] trait for this error. `main()` returns
/// `Result<(), Error>`, and should the `Err` variant be returned, the Rust runtime uses the `Debug`
/// implementation to produce an error message on stderr. The derived implementation is not very
/// readable, so `Debug` is implemented "by hand" in terms of `Display`.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("{source}"))]
    Config { source: config::Error },
    #[snafu(display("Failed to connect to the database: {source}"))]
    Database {
        #[snafu(source(from(sqlite::Error, Box::new)))]
        source: Box<sqlite::Error>,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to open the quill log file: {source}"))]
    LogFile { source: std::io::Error },
    #[snafu(display("Failed to HUP the logfile: {source}"))]
    LogHup {
        source: tokio::sync::mpsc::error::SendError<PathBuf>,
    },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("{source}"))]
    Templates { source: templates::Error },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            logging                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A tracing-compatible, "reopenable" log file
///
/// [MakeWriter] is implemented on `Arc<W>` or `Mutex<W>` for any `W` that implements
/// [std::io::Write], but not on `Arc<Mutex<W>>`. So the file is handed off to the [Layer] in toto,
/// and a side-band channel is used to tell it to re-open the file in response to a `SIGHUP`.
struct LogFile {
    fd: Arc<Mutex<std::fs::File>>,
}

impl LogFile {
    /// Open a file at `pth`; return a [LogFile] instance along with the send side of a channel
    /// the caller can use to close & re-open the file.
    pub fn open(pth: &Path) -> StdResult<(LogFile, mpsc::Sender<PathBuf>), std::io::Error> {
        let (tx, rx) = mpsc::channel::<PathBuf>(1);
        let fd = OpenOptions::new()
            .create(true)
            .append(true)
            .open(pth)
            .map(|fd| Arc::new(Mutex::new(fd)))?;
        tokio::spawn(LogFile::rehup(fd.clone(), rx));
        Ok((LogFile { fd }, tx))
    }
    /// Close & re-open the file
    async fn rehup(fd: Arc<Mutex<std::fs::File>>, mut rx: mpsc::Receiver<PathBuf>) {
        while let Some(ref pbuf) = rx.recv().await {
            match OpenOptions::new().create(true).append(true).open(pbuf) {
                Ok(f) => match fd.lock() {
                    Ok(mut guard) => *guard = f,
                    Err(err) => error!("Log file lock poisoned: {}", err),
                },
                Err(err) => error!("Failed to open {:?} ({}).", pbuf, err),
            }
        }
    }
}

pub struct LogFileWriter<'a>(MutexGuard<'a, std::fs::File>);

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;
    fn make_writer(&'a self) -> Self::Writer {
        // A poisoned lock just means some other thread panicked mid-write; keep logging.
        LogFileWriter(self.fd.lock().unwrap_or_else(|err| err.into_inner()))
    }
}

impl io::Write for LogFileWriter<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut *self.0, buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut *self.0)
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut *self.0, buf)
    }
}

/// Configure quill logging
///
/// Log to stdout, unless a log file is configured. If we're logging to file, also return the sender
/// side of a channel that can be used to signal the file to close & re-open itself.
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
    logfile: Option<&Path>,
) -> Result<(
    Box<dyn Layer<Registry> + Send + Sync>,
    EnvFilter,
    Option<mpsc::Sender<PathBuf>>,
)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `with_writer()` produce layers *of different types*; that's why
    // `Box<dyn Layer<S> + Send + Sync>` implements `Layer`:
    let mut tx = None;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = match logfile {
        Some(logfile) => {
            let (log_file, tx_inner) = LogFile::open(logfile).context(LogFileSnafu)?;
            tx = Some(tx_inner);
            if logopts.plain {
                Box::new(
                    fmt::Layer::default()
                        .compact()
                        .with_ansi(false)
                        .with_writer(log_file),
                )
            } else {
                Box::new(
                    fmt::Layer::default()
                        .json()
                        .with_current_span(true)
                        .with_writer(log_file),
                )
            }
        }
        None if logopts.plain => Box::new(fmt::Layer::default().compact().with_writer(io::stdout)),
        None => Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        ),
    };

    Ok((formatter, filter, tx))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         private routes                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn export_metrics(State(state): State<Arc<Quill>>) -> Response {
    match state.instruments.export() {
        Ok(text) => (
            [(
                http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            error!("Failed to encode metrics: {:?}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn clear_cache(State(state): State<Arc<Quill>>) -> StatusCode {
    state.page_cache.clear().await;
    info!("Page cache cleared on request.");
    StatusCode::NO_CONTENT
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 carries less information than a UUID, but it's more
/// easily read, and a useful gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Quill>, max_upload_size: usize) -> Router {
    // We want incoming requests to hit the `SetRequestIdLayer` *first*, so that must be the
    // last/outer layer applied:
    //
    //                 requests
    //                    |
    //                    v
    // +---------  SetRequestIdLayer      ---------+
    // | +-----      TraceLayer         -----+     |
    // | | +--- PropagateRequestIdLayer ---+ |     |
    // | | |          site router          | |     |
    // | | +--- PropagateRequestIdLayer ---+ |     |
    // | +-----      TraceLayer         -----+     |
    // +---------   SetRequestIdLayer     ---------+
    //                    |
    //                    v
    //                responses
    make_site_router(state)
        .layer(DefaultBodyLimit::max(max_upload_size))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
}

/// Make the [Router] that will only be locally accessible
fn make_local_router(state: Arc<Quill>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(export_metrics))
        .route("/ops/cache/clear", post(clear_cache))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

inventory::submit! { metrics::Registration::new("quilld.config.loaded", Sort::IntegralGauge) }

/// Build the application state from configuration
async fn make_state(cfg: &ConfigV1, instruments: Arc<Instruments>) -> Result<Arc<Quill>> {
    let storage = sqlite::Session::new(&cfg.database.url, cfg.database.max_connections)
        .await
        .context(DatabaseSnafu)?;
    // Seconds since the epoch at which this configuration took effect
    gauge_set!(instruments, "quilld.config.loaded", chrono::Utc::now().timestamp());
    Ok(Arc::new(Quill {
        storage: Arc::new(storage),
        page_cache: Arc::new(InMemoryPageCache::new(cfg.cache_capacity)),
        templates: templates::load().context(TemplatesSnafu)?,
        instruments,
        peppers: cfg.pepper.clone(),
        signing_keys: cfg.signing_keys.clone(),
        issuer: cfg.public_host.clone(),
        session_lifetime: Duration::seconds(cfg.session_lifetime),
        secure_cookies: cfg.secure_cookies,
        page_size: cfg.page_size,
        cache_ttl: StdDuration::from_secs(cfg.cache_ttl),
        media: MediaStore::new(cfg.media_root.clone()),
    }))
}

/// Serve quill requests until told to stop
#[tracing::instrument(skip(opts, cfg, log_file_hup))]
async fn serve(
    opts: CliOpts,
    mut cfg: ConfigV1,
    log_file_hup: Option<mpsc::Sender<PathBuf>>,
) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    check_metric_registrations();
    let instruments = Arc::new(Instruments::new("quill"));

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our state each pass, in case configuration values have changed; this also
        // leaves us with an empty page cache.
        let state = make_state(&cfg, instruments.clone()).await?;

        let world_nfy = Arc::new(Notify::new());
        let local_nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(state.clone(), cfg.max_upload_size),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()));

        let local_server = axum::serve(
            TcpListener::bind(cfg.private_address)
                .await
                .context(BindSnafu {
                    addr: cfg.private_address,
                })?,
            make_local_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(local_nfy.clone()));

        info!(
            "Serving quill on {} (private routes on {}).",
            cfg.public_address, cfg.private_address
        );

        let mut world_server = world_server.into_future();
        let mut local_server = local_server.into_future();

        tokio::select! {
            res = &mut world_server => {
                error!("The public server exited unexpectedly: {:?}", res);
                local_nfy.notify_one();
                log_on_err(local_server.await);
                break;
            },
            res = &mut local_server => {
                error!("The private server exited unexpectedly: {:?}", res);
                world_nfy.notify_one();
                log_on_err(world_server.await);
                break;
            },
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration & emptying the page cache.");
                // Signal our axum servers to shut-down...
                world_nfy.notify_one();
                local_nfy.notify_one();
                // & wait for them to complete.
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                state.page_cache.clear().await;
                drop(state);

                // Failure to parse here isn't fatal; keep going with the last good configuration.
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("Failed to re-read configuration ({}); keeping the old.", err);
                        cfg
                    }
                };
                if let (Some(lfh), Some(log_file)) = (&log_file_hup, &cfg.log_file) {
                    // `logrotate` & friends rename the log file underneath us, then HUP us to
                    // close & re-open it (under the same name).
                    lfh.send(log_file.clone()).await.context(LogHupSnafu)?;
                    info!("Started new log file.");
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                break;
            }
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Transition to async
///
/// Logging is only configured _after_ starting the async runtime (the log file's re-open task
/// needs it), and `serve()` is only entered _after_ that, since it's instrumented.
async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    #[allow(clippy::type_complexity)]
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(
        ConfigV1,
        Box<dyn Layer<Registry> + Send + Sync>,
        EnvFilter,
        Option<mpsc::Sender<PathBuf>>,
    )> {
        // Failure to parse at this point is fatal; in `serve()`, we fall back to the last
        // "known-good" configuration & keep going.
        let cfg = parse_config(&opts.cfg).context(ConfigSnafu)?;
        let (formatter, filter, log_file_hup) =
            configure_logging(&opts.log_opts, cfg.log_file.as_deref())?;
        Ok((cfg, formatter, filter, log_file_hup))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter, log_file_hup)) => {
            // Nb. this can only be invoked once (will panic on a second invocation)!
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            // Drop the guard, cleaning-up the bootstrap logger
            drop(bootstrap_logging_guard);

            info!("quill version {} starting.", crate_version!());

            serve(opts, cfg, log_file_hup).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most of quilld's configuration is read from file; the few command-line options govern where
    // to find that file & how to log. They all have corresponding environment variables for the
    // sake of convenience when running quill in a container.
    let opts = CliOpts::new(
        Command::new("quilld")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A small multi-user blogging service")
            .long_about(
                "`quilld` serves quill: posts, groups, comments & follows, rendered as HTML.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("QUILL_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QUILL_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QUILL_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QUILL_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QUILL_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    // Plenty can go wrong before we've parsed our configuration file and configured logging for
    // the process, so setup a *temporary* logger to stderr via `set_default()`.
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard)) // and start our server!
}
