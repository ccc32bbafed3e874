use anyhow::{bail, Context, Result};
use clap::{arg, command, Command};
use hcasfs::fs::import::{import_path, import_tar_auto};
use hcasfs::{Store, IMAGE_NAMESPACE};
use log::info;
use std::fs::File;
use std::io::Read;
use std::path::Path;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = command!()
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("mount")
                .about("Mount a labelled image read-only")
                .arg(arg!(<mountpoint> "Directory to mount on"))
                .arg(arg!(<root> "Store root directory"))
                .arg(arg!(<label> "Image label to mount")),
        )
        .subcommand(
            Command::new("import_tar")
                .about("Import a (possibly gzipped) tar archive and label its root")
                .arg(arg!(<root> "Store root directory"))
                .arg(arg!(<tar> "Archive path, or - for stdin"))
                .arg(arg!(<label> "Image label to assign")),
        )
        .subcommand(
            Command::new("import_path")
                .about("Import a local directory tree")
                .arg(arg!(<root> "Store root directory"))
                .arg(arg!(<dir> "Directory to import")),
        )
        .subcommand(
            Command::new("gc")
                .about("Run garbage collection to completion")
                .arg(arg!(<root> "Store root directory")),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("mount", sub)) => {
            let mountpoint = sub.get_one::<String>("mountpoint").unwrap();
            let root = sub.get_one::<String>("root").unwrap();
            let label = sub.get_one::<String>("label").unwrap();
            let store = Store::open(Path::new(root)).context("open store")?;
            hcasfs::fuse::mount(store, label, Path::new(mountpoint))
                .with_context(|| format!("mount {}", label))?;
        }
        Some(("import_tar", sub)) => {
            let root = sub.get_one::<String>("root").unwrap();
            let tar = sub.get_one::<String>("tar").unwrap();
            let label = sub.get_one::<String>("label").unwrap();
            let store = Store::open(Path::new(root)).context("open store")?;
            let session = store.session();

            let reader: Box<dyn Read> = if tar == "-" {
                Box::new(std::io::stdin())
            } else {
                Box::new(File::open(tar).with_context(|| format!("open {}", tar))?)
            };
            let name = import_tar_auto(&session, reader).context("import archive")?;
            store
                .set_label(IMAGE_NAMESPACE, label, &name)
                .context("set label")?;
            info!("imported {} as {}:{}", name, IMAGE_NAMESPACE, label);
            println!("{}", name);
        }
        Some(("import_path", sub)) => {
            let root = sub.get_one::<String>("root").unwrap();
            let dir = sub.get_one::<String>("dir").unwrap();
            let store = Store::open(Path::new(root)).context("open store")?;
            let session = store.session();
            let name = import_path(&session, Path::new(dir))
                .with_context(|| format!("import {}", dir))?;
            println!("{}", name);
        }
        Some(("gc", sub)) => {
            let root = sub.get_one::<String>("root").unwrap();
            let store = Store::open(Path::new(root)).context("open store")?;
            let complete = store.garbage_collect(u64::MAX).context("garbage collect")?;
            if !complete {
                bail!("garbage collection did not complete");
            }
            let stats = store.stats().context("store stats")?;
            info!(
                "gc complete, {} objects / {} bytes live",
                stats.objects, stats.total_bytes
            );
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}
