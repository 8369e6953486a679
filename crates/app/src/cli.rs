use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Spinning-cube demo for the kiln renderer")]
pub struct Cli {
    /// Engine config file; defaults apply when it does not exist.
    #[arg(long, value_name = "PATH", default_value = "kiln.toml")]
    pub config: PathBuf,

    /// Render without a window or GPU and print frame statistics.
    #[arg(long)]
    pub headless: bool,

    /// Frames to render in headless mode.
    #[arg(long, value_name = "N", default_value_t = 240)]
    pub frames: u64,

    /// Force the Vulkan validation layers on.
    #[arg(long)]
    pub validation: bool,

    /// Re-record primaries whenever a secondary is re-recorded. Always on
    /// for the Vulkan backend.
    #[arg(long)]
    pub strict: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["kiln"]);
        assert_eq!(cli.config, PathBuf::from("kiln.toml"));
        assert!(!cli.headless);
        assert_eq!(cli.frames, 240);
    }

    #[test]
    fn test_headless_frames() {
        let cli = Cli::parse_from(["kiln", "--headless", "--frames", "10"]);
        assert!(cli.headless);
        assert_eq!(cli.frames, 10);
    }
}
