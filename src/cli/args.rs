use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub struct MainArgs {
    /// The path to the config file for the payload computer
    #[clap(long, short)]
    pub config: PathBuf,

    /// A mission plan to start with instead of the one recovered from the
    /// previous run
    #[clap(long, short)]
    pub mission: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mission_is_optional() {
        let args = MainArgs::parse_from(["payload-computer", "-c", "payload.toml"]);
        assert_eq!(args.config, PathBuf::from("payload.toml"));
        assert!(args.mission.is_none());

        let args = MainArgs::parse_from([
            "payload-computer",
            "--config",
            "a.toml",
            "--mission",
            "m.json",
        ]);
        assert_eq!(args.mission, Some(PathBuf::from("m.json")));
    }
}
