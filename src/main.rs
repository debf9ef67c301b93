//! Mediakeep command line - import a folder, run maintenance, render thumbnails.

use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use mediakeep::decode::scan_directory;
use mediakeep::persistence::Persistence;
use mediakeep::{
    Config, Event, EventSink, FolderFileStore, ImageDecoder, JobKind, MaintenanceEngine, MediaId,
    MemoryPersistence, PageKey, Services, ThumbnailLoader,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mediakeep")]
#[command(about = "Thumbnails and background maintenance for a media library", long_about = None)]
struct Args {
    /// Library folder holding imported files and thumbnails
    library: PathBuf,

    /// Import every supported file found under this folder
    #[arg(long)]
    import: Option<PathBuf>,

    /// Drain the maintenance backlog before rendering
    #[arg(long)]
    force_maintenance: bool,

    /// Only drain this job kind (name or label)
    #[arg(long, requires = "force_maintenance")]
    kind: Option<String>,
}

const RENDER_TIMEOUT: Duration = Duration::from_secs(60);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let kind = args.kind.as_deref().map(|name| {
        JobKind::from_name(name)
            .or_else(|| JobKind::from_label(name))
            .unwrap_or_else(|| {
                eprintln!("Error: unknown job kind '{name}'");
                std::process::exit(1);
            })
    });

    if let Err(e) = std::fs::create_dir_all(&args.library) {
        eprintln!(
            "Error: Cannot create library '{}': {e}",
            args.library.display()
        );
        std::process::exit(1);
    }

    let files = FolderFileStore::new(&args.library);
    let persistence = Arc::new(MemoryPersistence::new());
    let (events, event_rx) = EventSink::channel();
    let services = Services::new(
        persistence.clone(),
        Arc::new(files.clone()),
        Arc::new(ImageDecoder::new()),
    )
    .with_events(events);

    // Without --import the library itself is rescanned; files already in place are not copied.
    let source = args.import.clone().unwrap_or_else(|| args.library.clone());
    let mut ids = Vec::new();
    for (index, path) in scan_directory(&source).into_iter().enumerate() {
        let id = MediaId(index as u64 + 1);
        match files.import(id, &path) {
            Ok(media) => {
                persistence.insert_media(media);
                ids.push(id);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "import failed"),
        }
    }
    tracing::info!(count = ids.len(), source = %source.display(), "files imported");

    if ids.is_empty() {
        eprintln!("No supported files found in '{}'", source.display());
        std::process::exit(1);
    }

    let engine = MaintenanceEngine::new(&config, services.clone());
    for job in [JobKind::RegenFileMetadata, JobKind::ForceThumbnail] {
        if let Err(e) = engine.schedule_jobs(&ids, job, Duration::ZERO) {
            eprintln!("Error: could not schedule {}: {e}", job.label());
            std::process::exit(1);
        }
    }

    if args.force_maintenance {
        match engine.force_maintenance(kind) {
            Ok(done) => tracing::info!(done, "maintenance drained"),
            Err(e) => tracing::error!(error = %e, "maintenance stopped"),
        }
    }

    let media = persistence.fetch_media(&ids).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let loader = ThumbnailLoader::new(&config, services, engine.clone());
    loader.start();
    loader.add_waterfall(PageKey(1), media);

    let mut pending: HashSet<MediaId> = ids.iter().copied().collect();
    let deadline = Instant::now() + RENDER_TIMEOUT;
    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match event_rx.recv_timeout(remaining) {
            Ok(Event::ThumbnailsRendered { media, .. }) => {
                for id in media {
                    pending.remove(&id);
                }
            }
            Ok(Event::ErrorReported { category, message }) => {
                eprintln!("{category:?}: {message}");
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    loader.shutdown();
    engine.shutdown();

    let stats = loader.cache_stats();
    println!(
        "rendered {} of {} thumbnails ({} cached, {} bytes)",
        ids.len() - pending.len(),
        ids.len(),
        stats.entries,
        stats.bytes
    );

    match engine.backlog() {
        Ok(backlog) if backlog.is_empty() => println!("maintenance backlog empty"),
        Ok(backlog) => {
            println!("maintenance backlog:");
            for (kind, count) in backlog {
                println!(
                    "  {:<60} {:>6} due {:>6} waiting",
                    kind.label(),
                    count.due,
                    count.not_due
                );
            }
        }
        Err(e) => eprintln!("Error: {e}"),
    }
}
