use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "alexa-api")]
#[command(about = "REST bridge for Alexa device control over an authenticated browser session")]
#[command(version)]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to the JSON configuration file (defaults to ./config.json)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() {
        let cli = Cli::try_parse_from(["alexa-api"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn parse_config_and_verbosity() {
        let cli = Cli::try_parse_from(["alexa-api", "-vv", "--config", "/etc/alexa.json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/alexa.json")));
    }
}
