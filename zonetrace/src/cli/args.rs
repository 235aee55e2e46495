//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use zonetrace_common::DEFAULT_PORT;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "zonetrace-capture",
    about = "Capture a trace from a zonetrace-instrumented process",
    after_help = "\
EXAMPLES:
    zonetrace-capture                              Capture from localhost:8086 until the client exits
    zonetrace-capture --export trace.json          Also write a Chrome trace
    zonetrace-capture 10.0.0.5 -p 9000 -d 30       Remote client, stop after 30 seconds"
)]
pub struct Args {
    /// Host running the instrumented process
    #[arg(value_name = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port the client listens on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Stop after N seconds (0 = until the client terminates)
    #[arg(short, long, default_value = "0")]
    pub duration: u64,

    /// Export a Chrome trace (chrome://tracing, Perfetto)
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Seconds to wait for the connection and handshake
    #[arg(long, default_value = "5")]
    pub connect_timeout: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["zonetrace-capture"]).unwrap();
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.duration, 0);
        assert!(args.export.is_none());
    }

    #[test]
    fn test_full_command_line() {
        let args =
            Args::try_parse_from(["zonetrace-capture", "10.0.0.5", "-p", "9000", "-d", "30", "--export", "t.json", "-q"])
                .unwrap();
        assert_eq!(args.host, "10.0.0.5");
        assert_eq!(args.port, 9000);
        assert_eq!(args.duration, 30);
        assert_eq!(args.export, Some(PathBuf::from("t.json")));
        assert!(args.quiet);
    }

    #[test]
    fn test_bad_port_is_a_usage_error() {
        let err = Args::try_parse_from(["zonetrace-capture", "-p", "70000"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
