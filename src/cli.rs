use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "A real-time chat relay with bounded history and typing presence")]
pub struct Args {
    /// Port to listen on [default: 3000]
    #[arg(long, short, env = "PORT")]
    pub port: Option<u16>,

    /// Interface to bind [default: 0.0.0.0]
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Directory of static files served over HTTP [default: public]
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Optional TOML config file
    #[arg(long, short, env = "CHAT_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not echo a message back to the connection that sent it
    #[arg(long)]
    pub no_echo: bool,

    /// Broadcast a `userLeft` event when a named participant disconnects
    #[arg(long)]
    pub announce_departures: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
