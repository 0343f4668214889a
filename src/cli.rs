use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "claudish", about = "Local HTTPS interception proxy for LLM clients", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy (control API + dispatcher lifecycle).
    Run(RunArgs),
    /// Log in to Gemini Code Assist (PKCE, opens a browser).
    LoginGemini,
    /// Log in to Kimi/Moonshot (device code, opens a browser).
    LoginKimi,
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Mirror tracing output to daily files instead of stderr.
    #[arg(long)]
    pub log_to_file: bool,

    /// Fixed control API port; random when omitted.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Enable the dispatcher immediately instead of waiting for the
    /// control API.
    #[arg(long)]
    pub enable: bool,
}
