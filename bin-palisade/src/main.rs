use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::sync::{RwLock, Semaphore, TryAcquireError};

use dns_resolver::cache::SharedCache;
use dns_resolver::cookies::CookieManager;
use dns_resolver::dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
use dns_resolver::enrich::{ThreatIntel, ThreatProvider};
use dns_resolver::events::Broadcaster;
use dns_resolver::recursive::IterativeResolver;
use dns_resolver::rrl::RateLimiter;
use dns_resolver::util::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to};
use dns_resolver::util::ports::PortPool;
use dns_resolver::util::types::TaskHandle;
use dns_types::protocol::types::*;
use dns_types::zones::types::{Zone, Zones};

mod control;
mod settings;

use settings::Settings;

const DNS_PORT: u16 = 53;
const PORT_REAP_INTERVAL: Duration = Duration::from_secs(60);

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
/// A hardened hybrid DNS server.
///
/// palisade serves authoritative zones and performs iterative recursive
/// resolution, with a sharded response cache (and optional serve-stale),
/// response rate limiting, DNS cookies, and threat-intelligence enrichment
/// of cached answers.
///
/// Most behaviour is driven by the settings file; the flags here cover the
/// basics and override it.
struct Args {
    /// Path to the settings file
    #[clap(short, long, value_parser)]
    config: Option<String>,

    /// Interface to listen on
    #[clap(short, long, value_parser)]
    interface: Option<IpAddr>,

    /// Port to listen on
    #[clap(short, long, value_parser)]
    port: Option<u16>,

    /// Only answer queries for which this server is authoritative: do not
    /// perform recursive resolution
    #[clap(long, action(clap::ArgAction::SetTrue))]
    authoritative_only: bool,

    /// Path to a zone file (TOML document or master file), can be specified
    /// more than once
    #[clap(short = 'z', long, value_parser)]
    zone_file: Vec<PathBuf>,

    /// Path to a directory to read zone files from, can be specified more
    /// than once
    #[clap(short = 'Z', long, value_parser)]
    zones_dir: Vec<PathBuf>,
}

fn begin_logging() {
    use std::collections::HashSet;
    use tracing_subscriber::EnvFilter;

    let log_format = if let Ok(var) = std::env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

/// Collect the zone file paths from the CLI and settings, and load them all.
/// Returns `None` if anything failed to load; a server with half its zones
/// is worse than one that refuses to start.
async fn load_zone_configuration(args: &Args, settings: &Settings) -> Option<Zones> {
    let mut is_error = false;

    let mut zone_file_paths = args.zone_file.clone();
    for path in &settings.zones.files {
        zone_file_paths.push(PathBuf::from(path));
    }

    let mut dirs = args.zones_dir.clone();
    for dir in &settings.zones.directories {
        dirs.push(PathBuf::from(dir));
    }
    for dir in &dirs {
        match files_in_dir(dir).await {
            Ok(mut paths) => zone_file_paths.append(&mut paths),
            Err(error) => {
                tracing::warn!(?dir, ?error, "could not read zone directory");
                is_error = true;
            }
        }
    }

    let mut zones = Zones::new();
    for path in &zone_file_paths {
        match zone_from_file(path).await {
            Ok(Ok(zone)) => {
                tracing::info!(origin = %zone.origin(), ?path, "loaded zone");
                zones.insert(zone);
            }
            Ok(Err(error)) => {
                tracing::warn!(?path, %error, "could not parse zone file");
                is_error = true;
            }
            Err(error) => {
                tracing::warn!(?path, ?error, "could not read zone file");
                is_error = true;
            }
        }
    }

    if is_error {
        None
    } else {
        Some(zones)
    }
}

async fn files_in_dir(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

#[derive(Debug, thiserror::Error)]
enum ZoneLoadError {
    #[error(transparent)]
    Document(#[from] dns_types::zones::document::Error),
    #[error(transparent)]
    MasterFile(#[from] dns_types::zones::deserialise::Error),
}

/// TOML files are zone documents; everything else is a master file.
async fn zone_from_file(path: &Path) -> Result<Result<Zone, ZoneLoadError>, std::io::Error> {
    let data = tokio::fs::read_to_string(path).await?;

    let parsed = if path.extension().is_some_and(|ext| ext == "toml") {
        Zone::from_document(&data).map_err(ZoneLoadError::from)
    } else {
        Zone::deserialise(&data).map_err(ZoneLoadError::from)
    };

    Ok(parsed)
}

fn servfail_response(id: u16) -> Option<Vec<u8>> {
    let mut response = Message::make_format_error_response(id);
    response.header.rcode = Rcode::ServerFailure;
    response.into_octets().ok()
}

async fn listen_udp_task(dispatcher: Dispatcher, socket: UdpSocket, permits: Arc<Semaphore>) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<(Vec<u8>, std::net::SocketAddr, usize)>(32);
    let mut buf = vec![0_u8; 4096];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                tracing::debug!(?peer, "UDP request");
                let bytes = buf[..size].to_vec();

                match Arc::clone(&permits).try_acquire_owned() {
                    Ok(permit) => {
                        let dispatcher = dispatcher.clone();
                        let reply = reply_tx.clone();
                        tokio::spawn(async move {
                            let outcome = dispatcher.handle(&bytes, peer).await;
                            if let DispatchOutcome::Respond { bytes, max_udp_payload } = outcome {
                                if let Err(error) = reply.send((bytes, peer, max_udp_payload)).await {
                                    tracing::debug!(?peer, %error, "UDP reply channel closed");
                                }
                            }
                            drop(permit);
                        });
                    }
                    Err(TryAcquireError::NoPermits) => {
                        // worker queue full: SERVFAIL if the query had an
                        // ID, silence otherwise
                        tracing::warn!(?peer, "worker queue full");
                        if let Some(id) = WireHeader::peek_id(&bytes) {
                            if let Some(response) = servfail_response(id) {
                                let _ = reply_tx.try_send((response, peer, 512));
                            }
                        }
                    }
                    Err(TryAcquireError::Closed) => return,
                }
            }

            Some((mut bytes, peer, max_udp_payload)) = reply_rx.recv() => {
                if let Err(error) = send_udp_bytes_to(&socket, peer, &mut bytes, max_udp_payload).await {
                    tracing::debug!(?peer, ?error, "UDP send error");
                }
            }
        }
    }
}

async fn listen_tcp_task(dispatcher: Dispatcher, listener: TcpListener, permits: Arc<Semaphore>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                tracing::debug!(?peer, "TCP request");
                let dispatcher = dispatcher.clone();
                let permits = Arc::clone(&permits);

                tokio::spawn(async move {
                    let bytes = match read_tcp_bytes(&mut stream).await {
                        Ok(bytes) => bytes,
                        Err(error) => {
                            tracing::debug!(?peer, %error, "TCP read error");
                            if let Some(id) = error.id() {
                                if let Ok(mut response) =
                                    Message::make_format_error_response(id).into_octets()
                                {
                                    let _ = send_tcp_bytes(&mut stream, &mut response).await;
                                }
                            }
                            return;
                        }
                    };

                    let outcome = match permits.try_acquire() {
                        Ok(_permit) => dispatcher.handle(bytes.as_ref(), peer).await,
                        Err(_) => {
                            tracing::warn!(?peer, "worker queue full");
                            match WireHeader::peek_id(bytes.as_ref())
                                .and_then(servfail_response)
                            {
                                Some(bytes) => DispatchOutcome::Respond {
                                    bytes,
                                    max_udp_payload: 512,
                                },
                                None => DispatchOutcome::NoResponse,
                            }
                        }
                    };

                    if let DispatchOutcome::Respond { mut bytes, .. } = outcome {
                        if let Err(error) = send_tcp_bytes(&mut stream, &mut bytes).await {
                            tracing::debug!(?peer, ?error, "TCP send error");
                        }
                    }
                });
            }
            Err(error) => tracing::debug!(?error, "TCP accept error"),
        }
    }
}

/// Reload zones on SIGUSR1, replacing the table atomically.
async fn reload_task(zones_lock: Arc<RwLock<Zones>>, args: Args, settings: Settings) {
    let mut stream = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGUSR1");
            return;
        }
    };

    loop {
        stream.recv().await;
        tracing::info!("SIGUSR1 received, reloading zones");

        if let Some(zones) = load_zone_configuration(&args, &settings).await {
            let count = zones.len();
            let mut lock = zones_lock.write().await;
            *lock = zones;
            tracing::info!(%count, "zone reload complete");
        } else {
            tracing::warn!("zone reload failed; keeping the old zones");
        }
    }
}

/// Log cache events at debug.  This is the always-on subscriber; operators
/// can attach their own through the broadcaster.
fn spawn_event_logger(broadcaster: &Broadcaster) -> TaskHandle {
    let (subscription, mut receiver) = broadcaster.subscribe();
    let broadcaster = broadcaster.clone();

    TaskHandle::spawn(move |mut shutdown| async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        broadcaster.unsubscribe(subscription);
                        return;
                    }
                }
                event = receiver.recv() => {
                    match event {
                        Some(event) => tracing::debug!(
                            kind = %event.kind,
                            qname = %event.qname,
                            reason = %event.reason,
                            "cache event"
                        ),
                        None => return,
                    }
                }
            }
        }
    })
}

fn spawn_port_reaper(ports: PortPool) -> TaskHandle {
    TaskHandle::spawn(move |mut shutdown| async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                () = tokio::time::sleep(PORT_REAP_INTERVAL) => {
                    let reaped = ports.reap();
                    if reaped > 0 {
                        tracing::warn!(%reaped, "reaped leaked source-port leases");
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let settings = match &args.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::error!(?error, "could not load settings");
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    let zones = match load_zone_configuration(&args, &settings).await {
        Some(zones) => zones,
        None => {
            tracing::error!("could not load configuration");
            process::exit(1);
        }
    };

    let rrl_config = match settings.rrl.to_config() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "bad RRL settings");
            process::exit(1);
        }
    };

    let cookies = match settings.cookies.cluster_secret_bytes() {
        Ok(Some(secret)) => {
            tracing::info!("cookie secrets in cluster-shared mode; rotation disabled");
            CookieManager::with_cluster_secret(secret, settings.cookies.require_valid)
        }
        Ok(None) => CookieManager::new(settings.cookies.require_valid),
        Err(error) => {
            tracing::error!(%error, "bad cookie settings");
            process::exit(1);
        }
    };

    let threat_intel = {
        let mut providers = settings
            .threat_intel
            .providers
            .iter()
            .map(|p| ThreatProvider::new(p.name.clone(), p.endpoint.clone()))
            .collect::<Vec<_>>();
        match providers.len() {
            0 => ThreatIntel::Disabled,
            1 => ThreatIntel::Single(providers.remove(0)),
            _ => ThreatIntel::Aggregate(providers),
        }
    };

    let broadcaster = Broadcaster::default();
    let cache = SharedCache::new(settings.cache.to_config(), broadcaster.clone());
    let rrl = Arc::new(RateLimiter::new(rrl_config));
    let ports = PortPool::new();
    let resolver = Arc::new(IterativeResolver::new(
        settings.resolver.to_config(),
        ports.clone(),
    ));
    let zones_lock = Arc::new(RwLock::new(zones));

    let authoritative_only = args.authoritative_only || settings.server.authoritative_only;
    let dispatcher = Dispatcher::new(
        Arc::clone(&zones_lock),
        cache.clone(),
        Arc::clone(&rrl),
        cookies.clone(),
        Arc::new(threat_intel),
        resolver,
        DispatcherConfig {
            recursion_enabled: !authoritative_only,
            query_deadline: Duration::from_secs(settings.server.query_deadline_seconds),
        },
    );

    // the admin surface consumes this handle; the transport is not this
    // process's concern
    let _control = control::Control::new(dispatcher.clone());

    let interface = args
        .interface
        .or(settings.server.interface)
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let port = args.port.or(settings.server.port).unwrap_or(DNS_PORT);

    tracing::info!(%interface, %port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((interface, port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(%interface, %port, "binding DNS TCP socket");
    let tcp = match TcpListener::bind((interface, port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    // bounded worker admission: when all permits are out, new queries get
    // SERVFAIL instead of queueing without limit
    let workers = settings.server.workers_per_cpu
        * std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let admission = Arc::new(Semaphore::new(workers * settings.server.queue_per_worker));

    // background tasks, stopped and joined on shutdown
    let background = vec![
        cache.spawn_cleanup(),
        rrl.spawn_sweep(),
        cookies.spawn_rotation(),
        spawn_port_reaper(ports),
        spawn_event_logger(&broadcaster),
    ];

    tokio::spawn(listen_udp_task(
        dispatcher.clone(),
        udp,
        Arc::clone(&admission),
    ));
    tokio::spawn(listen_tcp_task(dispatcher, tcp, admission));
    tokio::spawn(reload_task(zones_lock, args, settings));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down"),
        Err(error) => tracing::error!(?error, "could not wait for shutdown signal"),
    }

    for task in background {
        task.stop().await;
    }
}
