//! # Command-Line Interface Module
//!
//! Argument parsing for the demo binary: a scenario picker that exercises
//! the library end to end over a pair of in-process contexts wired
//! together through [`crate::transport::attach`].
//!
//! ## Usage Examples
//!
//! ```bash
//! # Run every scenario
//! eventa-demo
//!
//! # Run just the streaming-invoke scenario, with debug logs on stderr
//! eventa-demo --scenario streaming -v
//!
//! # Run the cancellation scenario quietly, writing diagnostics to a file
//! eventa-demo --scenario cancel --quiet --log-file demo.log
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Eventa Core demo — runs one or all invoke scenarios over an in-process
/// transport pair and prints what each side observed.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Which scenario to run
    ///
    /// Each scenario wires a fresh client/server context pair over
    /// [`crate::transport::InProcessAdapter`] and drives one corner of the
    /// invoke runtime: a plain unary round trip, a server-streamed
    /// response, a streamed response cancelled partway through, or a
    /// function value passed across the wire via the remote-methods
    /// boundary. The default runs all four in sequence.
    #[arg(short = 's', long, value_enum, default_value_t = Scenario::All)]
    pub scenario: Scenario,

    /// Silence all user-facing informational output on stdout
    ///
    /// When this flag is present, only diagnostic logs on stderr will be
    /// shown. Useful when piping the demo's output elsewhere.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and more: trace
    /// By default, only INFO and above are shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Write detailed diagnostic logs to this file instead of stderr
    ///
    /// Pass "stderr" explicitly to force stderr even if a default log
    /// file would otherwise be used.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

/// The scenarios the demo binary can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// A plain unary round trip: the client sends one number, the server
    /// doubles it and replies.
    #[value(name = "unary")]
    Unary,

    /// A server-streamed response: the client opens a countdown and
    /// consumes each chunk as the server produces it.
    #[value(name = "streaming")]
    Streaming,

    /// The same countdown as `streaming`, but the client cancels partway
    /// through and observes the call settle as `Aborted`.
    #[value(name = "cancel")]
    Cancel,

    /// A function value is serialized on one side, deserialized on the
    /// other as a callable stub, and invoked across the wire.
    #[value(name = "remote-methods")]
    RemoteMethods,

    /// Run every scenario in sequence.
    #[value(name = "all")]
    All,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scenario::Unary => write!(f, "unary"),
            Scenario::Streaming => write!(f, "streaming"),
            Scenario::Cancel => write!(f, "cancel"),
            Scenario::RemoteMethods => write!(f, "remote-methods"),
            Scenario::All => write!(f, "all"),
        }
    }
}

impl Scenario {
    /// Expand `All` to the concrete scenario list; pass other variants
    /// through unchanged.
    pub fn expand_all(self) -> Vec<Scenario> {
        match self {
            Scenario::All => vec![
                Scenario::Unary,
                Scenario::Streaming,
                Scenario::Cancel,
                Scenario::RemoteMethods,
            ],
            other => vec![other],
        }
    }
}
