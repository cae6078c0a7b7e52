use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use composefs_blob::{
    blob::build_blob,
    digests::compute_digests,
    dumpfile::write_dumpfile,
    fs::read_tree,
    header::has_acl,
    mount::mount_blob,
};

/// cfsblob
#[derive(Debug, Parser)]
#[clap(name = "cfsblob", version)]
pub struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enables fs-verity on every regular file under ROOT and prints the digests
    Digest { root: PathBuf },
    /// Prints the dumpfile for the directory tree at ROOT
    Dump {
        root: PathBuf,
        /// seal the files and include their digests
        #[clap(long)]
        digests: bool,
    },
    /// Builds DIR/composefs.blob from the directory tree at ROOT
    Create { root: PathBuf, dir: PathBuf },
    /// Prints whether the image was built with POSIX ACLs
    HasAcl { image: PathBuf },
    /// Mounts an image read-only
    Mount {
        image: PathBuf,
        /// the mountpoint
        mountpoint: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Digest { ref root } => {
            let digests = compute_digests(root)?;
            let mut stdout = std::io::stdout().lock();
            for (path, digest) in &digests {
                writeln!(stdout, "{digest} {}", path.display())?;
            }
        }
        Command::Dump { ref root, digests } => {
            let tree = read_tree(root)?;
            let digests = if digests {
                compute_digests(root)?
            } else {
                Default::default()
            };
            write_dumpfile(&mut std::io::stdout().lock(), &tree, &digests)?;
        }
        Command::Create { ref root, ref dir } => {
            let tree = read_tree(root)?;
            let digests = compute_digests(root)?;
            let path = build_blob(&digests, &tree, dir)
                .with_context(|| format!("Creating image in {}", dir.display()))?;
            println!("{}", path.display());
        }
        Command::HasAcl { ref image } => {
            println!("{}", has_acl(image)?);
        }
        Command::Mount {
            ref image,
            ref mountpoint,
        } => {
            mount_blob(image, mountpoint)?;
        }
    }
    Ok(())
}
