use clap::{Args, Parser, Subcommand};
use shmring::RingConfig;
use shmring::paths::DEFAULT_CHUNK_SIZE;

#[derive(Parser, Debug)]
#[command(author, version, about = "Operate shared-memory byte rings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a ring and copy stdin into it
    Write(WriteArgs),
    /// Attach to a ring and copy its bytes to stdout
    Read(ReadArgs),
    /// Remove the segment and semaphores of a ring left behind by a dead writer
    Cleanup {
        #[arg(long, value_parser = parse_key)]
        key: u32,
    },
    /// Decrement one header field, with or without its lock
    Decrement(DecrementArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RingArgs {
    /// Ring key, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_key)]
    pub key: u32,

    /// Payload capacity in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    pub capacity: usize,
}

impl RingArgs {
    pub fn config(&self) -> RingConfig {
        RingConfig::new(self.key, self.capacity)
    }
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    #[command(flatten)]
    pub ring: RingArgs,

    /// Largest chunk handed to the ring at once
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Wait for this many readers to attach before writing
    #[arg(long, default_value_t = 0)]
    pub readers: u64,

    /// After stdin ends, keep the ring alive until every reader detached
    #[arg(long)]
    pub linger: bool,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    #[command(flatten)]
    pub ring: RingArgs,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Stop after this many bytes
    #[arg(long)]
    pub limit: Option<u64>,

    /// How long to wait for the writer to create the ring
    #[arg(long, default_value_t = 5000)]
    pub wait_ms: u64,
}

#[derive(Args, Debug)]
pub struct DecrementArgs {
    #[command(flatten)]
    pub ring: RingArgs,

    /// Header field to decrement
    #[arg(long, default_value = "size")]
    pub field: String,

    /// Skip the field lock
    #[arg(long)]
    pub raw: bool,

    /// Pause between reading and writing the value
    #[arg(long, default_value_t = 20)]
    pub delay_ms: u64,
}

fn parse_key(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid ring key {value:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_key_accepts_decimal_and_hex() {
        assert_eq!(parse_key("4325408"), Ok(4325408));
        assert_eq!(parse_key("0x420420"), Ok(0x420420));
        assert!(parse_key("ring").is_err());
    }

    #[test]
    fn test_decrement_defaults() {
        let cli = Cli::parse_from(["ringctl", "decrement", "--key", "7", "--capacity", "16"]);
        match cli.command {
            Command::Decrement(args) => {
                assert_eq!(args.field, "size");
                assert_eq!(args.delay_ms, 20);
                assert!(!args.raw);
                assert_eq!(args.ring.config().total_size(), 61);
            }
            other => panic!("Expected decrement, got {other:?}"),
        }
    }
}
