use clap::{Parser, Subcommand, ValueEnum};
use photo_dbjobs::config::CatalogPaths;
use photo_dbjobs::models::{AlbumTagRelation, DuplicatesSearchRestrictions, ImageId};
use photo_dbjobs::scan::scan_collection;
use photo_dbjobs::{
    AlbumsJobInfo, CatalogDb, DatesJobInfo, DbJobEvent, DbJobsManager, DbJobsThread, HaarIface,
    JobContext, JobsConfig, Result, SearchesJobInfo, TagsJobInfo, WorkerPool,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "photo-dbjobs", version, about = "Run catalog database jobs from the command line")]
struct Cli {
    /// Catalog database file. Defaults to ./library.db.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON job configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads in the job pool.
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a directory tree and fingerprint its images.
    Scan { dir: PathBuf },
    /// Print image counts per album, tag or day.
    Folders { kind: FolderKind },
    /// List the images of an album.
    ListAlbum {
        root_id: i32,
        path: String,
        /// Skip sub-albums.
        #[arg(long)]
        flat: bool,
    },
    /// Rebuild duplicate groups.
    Duplicates {
        #[arg(long, value_delimiter = ',')]
        albums: Vec<i32>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<i32>,
        #[arg(long, value_delimiter = ',')]
        images: Vec<ImageId>,
        #[arg(long)]
        min: Option<f64>,
        #[arg(long)]
        max: Option<f64>,
        #[arg(long, value_enum, default_value_t = Relation::NoMix)]
        relation: Relation,
        #[arg(long, value_enum, default_value_t = Restriction::None)]
        restriction: Restriction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FolderKind {
    Albums,
    Tags,
    Dates,
}

#[derive(Clone, Copy, ValueEnum)]
enum Relation {
    NoMix,
    Union,
    Intersection,
    AlbumExclusive,
    TagExclusive,
}

impl From<Relation> for AlbumTagRelation {
    fn from(value: Relation) -> Self {
        match value {
            Relation::NoMix => AlbumTagRelation::NoMix,
            Relation::Union => AlbumTagRelation::Union,
            Relation::Intersection => AlbumTagRelation::Intersection,
            Relation::AlbumExclusive => AlbumTagRelation::AlbumExclusive,
            Relation::TagExclusive => AlbumTagRelation::TagExclusive,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Restriction {
    None,
    SameAlbum,
    DifferentAlbum,
}

impl From<Restriction> for DuplicatesSearchRestrictions {
    fn from(value: Restriction) -> Self {
        match value {
            Restriction::None => DuplicatesSearchRestrictions::None,
            Restriction::SameAlbum => DuplicatesSearchRestrictions::SameAlbum,
            Restriction::DifferentAlbum => DuplicatesSearchRestrictions::DifferentAlbum,
        }
    }
}

fn main() {
    env_logger::init();

    if let Err(err) = run(Cli::parse()) {
        log::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = CatalogPaths::discover(cli.db.as_deref())?;
    let mut config = JobsConfig::load(cli.config.as_deref())?;
    if let Some(threads) = cli.threads {
        config.max_threads = Some(threads);
    }
    let db = Arc::new(CatalogDb::open(&paths.db_path)?);
    let haar = Arc::new(HaarIface::new(db.clone(), config.duplicates.sketch_type));

    if let Command::Scan { dir } = &cli.command {
        let summary = scan_collection(&db, &haar, dir, |progress| {
            log::debug!("{}/{} {:?}", progress.processed, progress.discovered, progress.current_file);
        })?;
        println!(
            "discovered {}, imported {}, unchanged {}, fingerprinted {}, failed {}",
            summary.discovered, summary.imported, summary.unchanged, summary.fingerprinted, summary.failed
        );
        return Ok(());
    }

    let pool = WorkerPool::new(config.worker_threads())?;
    let manager = DbJobsManager::new(
        JobContext {
            core_db: db.clone(),
            lister: db.clone(),
            engine: haar,
            config,
        },
        pool,
    );

    let thread = match cli.command {
        Command::Scan { .. } => return Ok(()),
        Command::Folders { kind: FolderKind::Albums } => manager.start_albums_job_thread(AlbumsJobInfo {
            folders: true,
            ..AlbumsJobInfo::default()
        })?,
        Command::Folders { kind: FolderKind::Tags } => manager.start_tags_job_thread(TagsJobInfo {
            folders: true,
            ..TagsJobInfo::default()
        })?,
        Command::Folders { kind: FolderKind::Dates } => manager.start_dates_job_thread(DatesJobInfo {
            folders: true,
            ..DatesJobInfo::default()
        })?,
        Command::ListAlbum { root_id, path, flat } => manager.start_albums_job_thread(AlbumsJobInfo {
            recursive: !flat,
            album_root_id: root_id,
            album: path,
            ..AlbumsJobInfo::default()
        })?,
        Command::Duplicates {
            albums,
            tags,
            images,
            min,
            max,
            relation,
            restriction,
        } => {
            let mut info = if images.is_empty() {
                SearchesJobInfo::duplicates_for_scope(albums, tags, relation.into())
            } else {
                SearchesJobInfo::duplicates_for_images(images)
            };
            info.search_result_restriction = restriction.into();
            if let Some(min) = min {
                info.set_min_threshold(min)?;
            }
            if let Some(max) = max {
                info.set_max_threshold(max)?;
            }
            manager.start_searches_job_thread(info)?
        }
    };

    print_events(&thread);
    if thread.has_errors() {
        for error in thread.errors_list() {
            eprintln!("job error: {error}");
        }
    }
    Ok(())
}

fn print_events(thread: &DbJobsThread) {
    for event in thread.events() {
        match event {
            DbJobEvent::FoldersData(counts) => {
                let mut counts: Vec<_> = counts.into_iter().collect();
                counts.sort();
                for (id, count) in counts {
                    println!("{id}\t{count}");
                }
            }
            DbJobEvent::FaceFoldersData(properties) => {
                for (property, counts) in properties {
                    for (tag, count) in counts {
                        println!("{property}\t{tag}\t{count}");
                    }
                }
            }
            DbJobEvent::DateFoldersData(dates) => {
                for (date, count) in dates {
                    println!("{date}\t{count}");
                }
            }
            DbJobEvent::Data(records) => {
                for record in records {
                    println!("{}\t{}\t{}x{}", record.image_id, record.name, record.width, record.height);
                }
            }
            DbJobEvent::DirectQueryData(ids) => {
                for id in ids {
                    println!("{id}");
                }
            }
            DbJobEvent::TotalSize(total) => log::info!("Scanning {total} images"),
            DbJobEvent::ProcessedSize(done) => log::debug!("Processed {done} images"),
            DbJobEvent::Error(message) => log::warn!("{message}"),
            DbJobEvent::Started | DbJobEvent::Done => {}
            DbJobEvent::Finished => break,
        }
    }
}
