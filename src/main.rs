use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

mod archive;
mod archive_probe;
mod cache;
mod config;
mod error;
mod filesystem;
mod handle;
mod inode;
mod name_mapper;
mod path_resolver;

use config::MountOptions;
use filesystem::ZipRoFs;

const DEFAULT_CACHE_SIZE: usize = 1000;

/// A read-only FUSE mount presenting every `.zip` (and `.d.Zip`) archive under `ROOT` as a
/// transparent directory of its entries.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// The directory tree to present through the mount.
	root: PathBuf,

	/// Where to attach the presented view.
	mountpoint: PathBuf,

	/// Comma-separated mount options: foreground, debug, allowother, async, cachesize=N.
	#[arg(short = 'o', value_delimiter = ',')]
	options: Vec<String>,
}

fn main() {
	let args = Args::parse();

	let raw_options = args.options.join(",");
	let options = match MountOptions::parse(&raw_options) {
		Ok(options) => options,
		Err(e) => {
			eprintln!("invalid mount options: {:#}", e);
			std::process::exit(1);
		}
	};

	init_logging(options.debug);

	if let Err(e) = run(args.root, args.mountpoint, options) {
		tracing::error!("mount failed: {:#}", e);
		std::process::exit(1);
	}
}

fn init_logging(debug: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Builds the filesystem and blocks until it's unmounted. Argument parsing and process
/// daemonization proper are out of scope here (see DESIGN.md); `foreground` is honored only to
/// the extent of keeping diagnostics on the controlling terminal, since `fuser::mount2` already
/// runs in the foreground of the calling process.
fn run(root: PathBuf, mountpoint: PathBuf, options: MountOptions) -> Result<()> {
	let root = root.canonicalize().with_context(|| format!("failed to resolve root <{}>", root.display()))?;
	if !root.is_dir() {
		anyhow::bail!("root <{}> is not a directory", root.display());
	}

	let cache_size = options.cache_size.unwrap_or(DEFAULT_CACHE_SIZE);
	let cache_capacity = NonZeroUsize::new(cache_size).context("cachesize must be >= 1")?;

	tracing::info!(root = %root.display(), mountpoint = %mountpoint.display(), cache_size, "mounting");

	let fs = ZipRoFs::new(root, cache_capacity, options.async_read);

	let mut mount_options = vec![
		MountOption::RO,
		MountOption::FSName("ziprofs".to_string()),
		MountOption::Subtype("ziprofs".to_string()),
	];
	if options.allow_other {
		mount_options.push(MountOption::AllowOther);
	}
	for extra in &options.extra {
		mount_options.push(MountOption::CUSTOM(extra.clone()));
	}

	fuser::mount2(fs, &mountpoint, &mount_options).with_context(|| format!("failed to mount at <{}>", mountpoint.display()))?;

	tracing::info!("unmounted cleanly");
	Ok(())
}
