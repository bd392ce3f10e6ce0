use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::client::TorrentClient;
use crate::error::Result;
use crate::session::SessionConfig;
use crate::torrent::TorrentDescriptor;

#[derive(Parser)]
#[command(name = "bitswarm")]
#[command(about = "A BitTorrent client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent file
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Port to report to the tracker
        #[arg(short, long, default_value = "6881")]
        port: u16,

        /// Maximum number of peers to connect to
        #[arg(short, long, default_value = "50")]
        max_peers: usize,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                port,
                max_peers,
            } => {
                let config = SessionConfig {
                    download_dir: output.clone(),
                    listen_port: *port,
                    max_peers: *max_peers,
                };
                TorrentClient::new(config).download(torrent).await?;
            }
            Commands::Info { torrent } => {
                show_torrent_info(torrent).await?;
            }
        }
        Ok(())
    }
}

async fn show_torrent_info(torrent_path: &PathBuf) -> Result<()> {
    let metainfo = crate::torrent::load_torrent_file(torrent_path).await?;
    let descriptor = TorrentDescriptor::from_metainfo(metainfo.clone());

    println!("Name:         {}", descriptor.name);
    println!("Tracker:      {}", descriptor.announce);
    println!("Total size:   {} bytes", descriptor.total_size);
    println!("Piece length: {} bytes", descriptor.piece_length);
    println!("Pieces:       {}", descriptor.piece_count());
    println!("Info hash:    {}", hex::encode(descriptor.info_hash));
    println!("\nFiles:");
    for (i, file) in descriptor.files.iter().enumerate() {
        println!(
            "  {}: {} ({} bytes)",
            i + 1,
            file.path.join("/"),
            file.length
        );
    }

    if let Some(announce_list) = &metainfo.announce_list {
        println!("\nAdditional trackers:");
        for (tier, trackers) in announce_list.iter().enumerate() {
            println!("  Tier {}:", tier + 1);
            for tracker in trackers {
                println!("    - {tracker}");
            }
        }
    }
    Ok(())
}
