//! Command-line definitions.

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use pw_core::TabId;
use pw_tracker::BlockListKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "portwatch",
    version,
    about = "Find and track cross-document message listeners",
    after_help = "\
EXAMPLES:
    portwatch scan --url https://app.example/ page.js vendor.js
    portwatch listeners --tab 1
    portwatch block add --kind pattern 'google'
    portwatch config log-url https://collector.example/ingest"
)]
pub struct Args {
    /// Directory holding persisted state (defaults to $PORTWATCH_STORAGE_DIR, then ./.portwatch)
    #[arg(long, global = true, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run page scripts instrumented and record their message listeners
    Scan {
        /// Tab the page is loaded in
        #[arg(long, default_value = "1")]
        tab: TabId,

        /// Page URL the scripts run under
        #[arg(long)]
        url: String,

        /// Run inside a child frame with this name instead of the top window
        #[arg(long, value_name = "NAME")]
        frame_name: Option<String>,

        /// Script files, executed in order
        #[arg(value_name = "SCRIPT", required = true)]
        scripts: Vec<PathBuf>,
    },

    /// Print tracked listeners that no block rule hides
    Listeners {
        #[arg(long)]
        tab: Option<TabId>,
    },

    /// Forget everything recorded for a tab
    Clear {
        #[arg(long)]
        tab: TabId,
    },

    /// Manage block rules
    #[command(subcommand)]
    Block(BlockCommand),

    /// Inspect or change settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub enum BlockCommand {
    Add {
        #[arg(long, value_enum)]
        kind: RuleKind,
        value: String,
    },
    Remove {
        #[arg(long, value_enum)]
        kind: RuleKind,
        value: String,
    },
    List {
        #[arg(long, value_enum)]
        kind: Option<RuleKind>,
    },
    /// Write one list as an export document
    Export {
        #[arg(long, value_enum)]
        kind: RuleKind,
        /// Defaults to stdout
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Merge an export document into one list
    Import {
        #[arg(long, value_enum)]
        kind: RuleKind,
        file: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Toggle deduplication of identical listeners
    Dedupe {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Collector receiving every new listener; pass "" to disable
    LogUrl { url: String },
    Show,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuleKind {
    Code,
    Url,
    Pattern,
}

impl RuleKind {
    pub const ALL: [RuleKind; 3] = [RuleKind::Code, RuleKind::Url, RuleKind::Pattern];

    pub fn label(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Url => "url",
            Self::Pattern => "pattern",
        }
    }
}

impl From<RuleKind> for BlockListKind {
    fn from(kind: RuleKind) -> Self {
        match kind {
            RuleKind::Code => Self::Code,
            RuleKind::Url => Self::Url,
            RuleKind::Pattern => Self::Pattern,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[cfg(test)]
mod tests {
    use super::Args;
    use super::BlockCommand;
    use super::Command;
    use super::RuleKind;
    use clap::Parser;

    #[test]
    fn parses_scan_with_frame() {
        let args = Args::try_parse_from([
            "portwatch",
            "--storage-dir",
            "/tmp/pw",
            "scan",
            "--url",
            "https://app.example/",
            "--frame-name",
            "composer",
            "a.js",
            "b.js",
        ])
        .unwrap_or_else(|_| unreachable!());

        assert!(args.storage_dir.is_some());
        match args.command {
            Command::Scan {
                tab,
                frame_name,
                scripts,
                ..
            } => {
                assert_eq!(tab, 1);
                assert_eq!(frame_name.as_deref(), Some("composer"));
                assert_eq!(scripts.len(), 2);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn parses_block_add() {
        let args = Args::try_parse_from(["portwatch", "block", "add", "--kind", "pattern", "eval"])
            .unwrap_or_else(|_| unreachable!());
        match args.command {
            Command::Block(BlockCommand::Add { kind, value }) => {
                assert_eq!(kind, RuleKind::Pattern);
                assert_eq!(value, "eval");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn scan_requires_scripts() {
        assert!(Args::try_parse_from(["portwatch", "scan", "--url", "https://a.example/"]).is_err());
    }
}
