mod cli;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Commands};
use coordfs::config::load_config;
use coordfs::coord::EtcdCoordinator;
use coordfs::meta::Inode;
use coordfs::vfs::VirtualFileSystem;
use env_logger::{Builder, Env, Target};
use log::info;
use std::sync::Arc;

fn init_logging() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .target(Target::Stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = cli.config.to_string_lossy();
    let settings = load_config(&config)?;
    let client = Arc::new(
        EtcdCoordinator::connect(&settings.coordination)
            .await
            .context("failed to connect to the coordination service")?,
    );
    let fs = VirtualFileSystem::mount(settings, client).await?;

    let result = run(&fs, cli.command).await;
    fs.close().await;
    result
}

async fn run(fs: &VirtualFileSystem, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Mkdir { domain, path } => {
            let dir = fs.mkdir(&domain, &path).await?;
            println!("{}", dir.uuid);
        }
        Commands::Ls {
            domain,
            path,
            recursive,
        } => {
            for inode in fs.list(&domain, &path, recursive).await? {
                print_entry(&inode);
            }
        }
        Commands::Put {
            source,
            domain,
            path,
            keep_lock,
        } => {
            let bytes = tokio::fs::read(&source)
                .await
                .with_context(|| format!("failed to read {}", source.display()))?;
            let mut writer = fs.writer(&domain, &path, true).await?;
            writer.write(&bytes).await?;
            let synced = writer.commit(!keep_lock).await?.wait().await?;
            info!(
                "{domain}:{} synced ({} bytes)",
                synced.absolute_path,
                synced.file_info().map(|f| f.synced_size).unwrap_or_default()
            );
        }
        Commands::Get {
            domain,
            path,
            target,
        } => {
            let mut reader = fs.reader(&domain, &path).await?;
            let bytes = reader.read_to_end().await?;
            tokio::fs::write(&target, &bytes)
                .await
                .with_context(|| format!("failed to write {}", target.display()))?;
        }
        Commands::Rm {
            domain,
            path,
            recursive,
        } => {
            if !fs.delete(&domain, &path, recursive).await? {
                bail!("{domain}:{path} does not exist");
            }
        }
        Commands::Find {
            domain,
            pattern,
            path,
            dir,
        } => {
            for inode in fs.find(&domain, &path, dir.as_deref(), &pattern).await? {
                print_entry(&inode);
            }
        }
        Commands::Stat { domain, path } => {
            let inode = fs
                .get(&domain, &path)
                .await?
                .with_context(|| format!("{domain}:{path} does not exist"))?;
            println!("{}", serde_json::to_string_pretty(&inode)?);
        }
    }
    Ok(())
}

fn print_entry(inode: &Inode) {
    let state = inode
        .state()
        .map(|s| format!("{s:?}"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<9} {:<11} {}",
        format!("{:?}", inode.inode_type()),
        state,
        inode.absolute_path
    );
}
