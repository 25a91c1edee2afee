use clap::{ArgAction, Parser, ValueHint};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_STATE_FILE: &str = "./state.json";

#[derive(Parser, Debug)]
#[command(name = "control-mitm", author, version, about)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind_addr: SocketAddr,

    /// File holding the proxy's identities (created if missing)
    #[arg(
        long,
        env = "STATE_FILE",
        value_hint = ValueHint::FilePath,
        default_value = DEFAULT_STATE_FILE
    )]
    pub state_file: PathBuf,

    /// Base URL of the real control server
    #[arg(long, env = "UPSTREAM_URL", value_hint = ValueHint::Url)]
    pub upstream_url: String,

    /// Dump request and response headers
    #[arg(long, env = "DUMP_HEADERS", default_value_t = true, action = ArgAction::Set)]
    pub dump_headers: bool,

    /// Dump request and response bodies
    #[arg(long, env = "DUMP_BODIES", default_value_t = true, action = ArgAction::Set)]
    pub dump_bodies: bool,

    /// Dump every record of machine map polls
    #[arg(long, env = "DUMP_MAPPOLLS", default_value_t = true, action = ArgAction::Set)]
    pub dump_mappolls: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["control-mitm", "--upstream-url", "https://c.example"])
            .unwrap();
        assert_eq!(args.bind_addr, DEFAULT_BIND_ADDR.parse().unwrap());
        assert_eq!(args.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert!(args.dump_headers && args.dump_bodies && args.dump_mappolls);
    }

    #[test]
    fn test_dump_flags_can_be_disabled() {
        let args = Args::try_parse_from([
            "control-mitm",
            "--upstream-url",
            "https://c.example",
            "--dump-bodies",
            "false",
        ])
        .unwrap();
        assert!(!args.dump_bodies);
        assert!(args.dump_headers);
    }
}
