//! Clap derive structures for the `matterlink` CLI.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use matterlink_core::UserStatus;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// matterlink -- resilient Mattermost client for the terminal
#[derive(Debug, Parser)]
#[command(
    name = "matterlink",
    version,
    about = "Talk to Mattermost servers from the command line",
    long_about = "A command-line client for Mattermost servers.\n\n\
        Keeps a self-healing session (REST + WebSocket event stream) with\n\
        automatic reconnection, and prints normalized events.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Server profile to use
    #[arg(long, short = 'p', env = "MATTERLINK_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Server address (overrides profile)
    #[arg(long, short = 's', env = "MATTERLINK_SERVER", global = true)]
    pub server: Option<String>,

    /// Primary team name (overrides profile)
    #[arg(long, short = 't', env = "MATTERLINK_TEAM", global = true)]
    pub team: Option<String>,

    /// Username or email for password logins
    #[arg(long, short = 'l', env = "MATTERLINK_LOGIN", global = true)]
    pub login: Option<String>,

    /// Password, `token=<pat>`, or `MMAUTHTOKEN=<cookie>`
    #[arg(long, env = "MATTERLINK_SECRET", global = true, hide_env_values = true)]
    pub secret: Option<String>,

    /// One-time MFA code
    #[arg(long, global = true)]
    pub mfa: Option<String>,

    /// Use plain http/ws instead of https/wss
    #[arg(long, env = "MATTERLINK_NO_TLS", global = true)]
    pub no_tls: bool,

    /// Accept invalid TLS certificates
    #[arg(long, short = 'k', env = "MATTERLINK_INSECURE", global = true)]
    pub insecure: bool,

    /// Request timeout in seconds
    #[arg(long, env = "MATTERLINK_TIMEOUT", global = true)]
    pub timeout: Option<u64>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "MATTERLINK_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream normalized events until interrupted
    #[command(alias = "l")]
    Listen(ListenArgs),

    /// List channels of the joined teams
    #[command(alias = "ch")]
    Channels(ChannelsArgs),

    /// Post a message to a channel
    Post(PostArgs),

    /// Set your presence
    Status(StatusArgs),

    /// Manage configuration and stored secrets
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Command Arguments ────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Only print events from this channel
    #[arg(long, short = 'c')]
    pub channel: Option<String>,

    /// Only print message events (posted, edited, deleted)
    #[arg(long, short = 'm')]
    pub messages_only: bool,

    /// Keep the account active by marking this channel viewed
    #[arg(long, value_name = "CHANNEL")]
    pub anti_idle: Option<String>,
}

#[derive(Debug, Args)]
pub struct ChannelsArgs {
    /// Also list public channels you have not joined
    #[arg(long, short = 'a')]
    pub all: bool,
}

#[derive(Debug, Args)]
pub struct PostArgs {
    /// Channel name in the primary team
    pub channel: String,

    /// Message text
    pub message: String,

    /// Post id to reply to (thread root)
    #[arg(long, short = 'r')]
    pub reply_to: Option<String>,

    /// Attach a file (repeatable)
    #[arg(long, short = 'f')]
    pub file: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// online, away, dnd, or offline
    pub status: UserStatus,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show configured profiles
    Show,

    /// Store a password or personal token in the system keyring
    SetSecret {
        /// Which secret to store
        #[arg(long, default_value = "password")]
        kind: SecretKind,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SecretKind {
    Password,
    Token,
}

impl SecretKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Token => "token",
        }
    }
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
