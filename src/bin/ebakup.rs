use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::{Parser, Subcommand};

use ebakup::backup::{check_sources, epoch_now, run_backup};
use ebakup::shadow::shadow_copy;
use ebakup::sync::sync_storages;
use ebakup::verify::verify_storage;
use ebakup_datastore::Storage;

#[derive(Parser)]
#[command(name = "ebakup", about = "Deduplicating, self-verifying backup storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up one or more directories into a new snapshot
    Backup {
        /// Storage root directory
        #[arg(long)]
        store: PathBuf,
        /// Create the storage if it does not exist yet
        #[arg(long)]
        create: bool,
        /// Directories to back up
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// Mirror all snapshots and referenced objects into another storage
    Sync {
        #[arg(long)]
        store: PathBuf,
        /// Destination storage root (created if missing)
        #[arg(long)]
        dest: PathBuf,
    },
    /// Check every block, object and manifest reference
    Verify {
        #[arg(long)]
        store: PathBuf,
    },
    /// Materialize a snapshot as a tree of hard links
    Shadowcopy {
        #[arg(long)]
        store: PathBuf,
        /// Snapshot name (YYYY/MM-DDThh:mm)
        #[arg(long)]
        snapshot: String,
        /// Target directory (created, must be empty)
        target: PathBuf,
    },
    /// Print a storage summary as JSON
    Info {
        #[arg(long)]
        store: PathBuf,
    },
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Backup {
            store,
            create,
            sources,
        } => {
            check_sources(&sources)?;
            let storage = if create && !store.join("db").exists() {
                Storage::create(&store)?
            } else {
                Storage::open(&store)?
            };
            let (name, stats) = run_backup(&storage, &sources, epoch_now())?;
            println!(
                "snapshot {} created: {} files, {} directories, {} special, {} bytes",
                name, stats.files, stats.directories, stats.special_files, stats.bytes
            );
        }
        Commands::Sync { store, dest } => {
            let stats = sync_storages(&store, &dest)?;
            println!(
                "synced {} snapshots ({} objects copied, {} already present)",
                stats.snapshots_copied, stats.objects_copied, stats.objects_present
            );
        }
        Commands::Verify { store } => {
            let storage = Storage::open(&store)?;
            let stats = verify_storage(&storage)?;
            println!(
                "checked {} objects and {} snapshots: {} corrupt blocks, \
                 {} missing objects, {} bad objects, {} missing references",
                stats.objects_checked,
                stats.snapshots_checked,
                stats.corrupt_blocks,
                stats.objects_missing,
                stats.objects_bad,
                stats.missing_cids
            );
            if !stats.is_clean() {
                bail!("verification found problems");
            }
        }
        Commands::Shadowcopy {
            store,
            snapshot,
            target,
        } => {
            let storage = Storage::open(&store)?;
            let stats = shadow_copy(&storage, &snapshot, &target)?;
            println!(
                "shadow copy of {} at {:?}: {} linked, {} recreated, {} skipped",
                snapshot, target, stats.linked, stats.recreated, stats.skipped
            );
        }
        Commands::Info { store } => {
            let storage = Storage::open(&store)?;
            let snapshots: Vec<_> = storage
                .snapshots()?
                .into_iter()
                .map(|info| {
                    serde_json::json!({
                        "name": info.name,
                        "start-time": info.start_time,
                    })
                })
                .collect();

            let mut objects = 0u64;
            let mut errors = 0u64;
            for entry in storage.content_index()?.iterate()? {
                match entry {
                    Ok(_) => objects += 1,
                    Err(_) => errors += 1,
                }
            }

            let info = serde_json::json!({
                "root": storage.root(),
                "checksum": storage.checksum_kind().name(),
                "blocksize": storage.blocksize(),
                "snapshots": snapshots,
                "objects": objects,
                "index-errors": errors,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}
