use clap::{Parser, Subcommand};

use call_signaling::telemetry::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "call-demo")]
#[command(about = "Drives two call agents against each other over an in-process relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Use the STUN servers from the environment instead of host candidates only
    #[arg(long, global = true)]
    pub stun: bool,
}

impl Cli {
    pub fn log_level(&self) -> LogLevel {
        match self.verbose {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Place a call between two local agents and hang up after a while
    Loopback {
        #[arg(long, default_value = "alice")]
        caller: String,

        #[arg(long, default_value = "bob")]
        callee: String,

        /// Seconds to stay in the call; Ctrl-C hangs up early
        #[arg(long, default_value_t = 5)]
        hangup_after_secs: u64,

        /// Let the callee decline instead of answering
        #[arg(long)]
        decline: bool,
    },
}
