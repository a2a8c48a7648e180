use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "votegate",
    about = "Operate the votegate face verification gate",
    version
)]
pub struct Cli {
    /// Emit structured JSON to stdout instead of human-readable logs
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (defaults to /etc/votegate/config.toml, then /usr/local/etc/votegate/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Enroll a face template for an identity from an image file
    Enroll(EnrollArgs),
    /// Verify an image against an enrolled identity and mint a credential
    Verify(VerifyArgs),
    /// Show whether an identity is enrolled
    Status(IdentityArgs),
    /// Delete the enrolled template of an identity
    Revoke(IdentityArgs),
    /// Inspect verification tokens
    #[command(subcommand)]
    Token(TokenCommands),
    /// Print recent audit log entries
    Audit(AuditArgs),
    /// Manage the embedding encryption key in the Secret Service
    #[command(subcommand)]
    Keyring(KeyringCommands),
    /// Run environment diagnostics
    Doctor,
}

#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    /// Optional path to the dlib landmark predictor model (falls back to config, then $DLIB_LANDMARK_MODEL)
    #[arg(long)]
    pub landmark_model: Option<PathBuf>,

    /// Optional path to the dlib face recognition network (falls back to config, then $DLIB_ENCODER_MODEL)
    #[arg(long)]
    pub encoder_model: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct EnrollArgs {
    /// Identity to enroll (wallet address or user id)
    #[arg(long)]
    pub identity: String,

    /// PNG or JPEG image containing exactly one face
    #[arg(long)]
    pub image: PathBuf,

    #[command(flatten)]
    pub models: ModelArgs,
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    /// Identity to verify against
    #[arg(long)]
    pub identity: String,

    /// Probe image
    #[arg(long)]
    pub image: PathBuf,

    /// Skip the liveness checks for this attempt
    #[arg(long)]
    pub skip_liveness: bool,

    #[command(flatten)]
    pub models: ModelArgs,
}

#[derive(Debug, Clone, Args)]
pub struct IdentityArgs {
    /// Identity (wallet address or user id)
    pub identity: String,
}

#[derive(Debug, Clone, Subcommand)]
pub enum TokenCommands {
    /// Check a token's signature, expiry and claims
    Validate(TokenArgs),
    /// Decode a token's expiry without validating it
    Expiry(TokenArgs),
}

#[derive(Debug, Clone, Args)]
pub struct TokenArgs {
    pub token: String,
}

#[derive(Debug, Clone, Args)]
pub struct AuditArgs {
    /// Only show attempts for this identity
    #[arg(long)]
    pub identity: Option<String>,

    /// Show at most this many of the most recent entries
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Clone, Subcommand)]
pub enum KeyringCommands {
    /// Generate a fresh embedding key and store it in the Secret Service
    Init(KeyringInitArgs),
}

#[derive(Debug, Clone, Args)]
pub struct KeyringInitArgs {
    /// Replace an existing key; records encrypted with it become unreadable
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl From<bool> for OutputMode {
    fn from(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from(self.json)
    }
}
