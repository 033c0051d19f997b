use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gossip_membership::{GossipConfig, Node};

/// Runs one member of a gossip cluster until interrupted.
#[derive(Parser, Debug)]
#[command(name = "gossip-node")]
struct Args {
    /// Address of this node, exactly as listed in the members file
    address: String,

    /// Newline delimited host:port list of every cluster member, including this one
    #[arg(long, default_value = "config/startup_members")]
    members: PathBuf,

    #[arg(long, default_value_t = 5_000)]
    gossip_interval_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    cleanup_timeout_ms: u64,

    /// Fraction of outgoing gossip messages to drop on purpose
    #[arg(long, default_value_t = 0.25)]
    loss_probability: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let members = read_members(&args.members)?;
    let config = GossipConfig::default()
        .with_gossip_interval(Duration::from_millis(args.gossip_interval_ms))
        .with_cleanup_timeout(Duration::from_millis(args.cleanup_timeout_ms))
        .with_loss_probability(args.loss_probability);

    let mut node = Node::bind(config, &args.address, members.as_slice()).await
        .with_context(|| format!("could not start {}", args.address))?;
    node.start();

    let cancelled = node.cancellation_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("could not listen for ctrl-c")?,
        _ = cancelled.cancelled() => {}
    }
    node.shutdown().await;
    Ok(())
}

fn read_members(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read startup members from {}", path.display()))?;
    Ok(parse_members(&content))
}

fn parse_members(content: &str) -> Vec<String> {
    content.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_file_skips_blanks_and_comments() {
        let content = "# cluster\n127.0.0.1:2222\n\n  127.0.0.1:2223  \n#127.0.0.1:2224\n";
        assert_eq!(vec!["127.0.0.1:2222", "127.0.0.1:2223"], parse_members(content));
    }

    #[test]
    fn missing_members_file_is_an_error() {
        assert!(read_members(Path::new("does/not/exist")).is_err());
    }

    #[test]
    fn cli_defaults() {
        let args = Args::parse_from(["gossip-node", "127.0.0.1:2222"]);
        assert_eq!(PathBuf::from("config/startup_members"), args.members);
        assert_eq!(5_000, args.gossip_interval_ms);
        assert_eq!(10_000, args.cleanup_timeout_ms);
        assert_eq!(0.25, args.loss_probability);
    }
}
