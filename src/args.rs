use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "vendlink", about = "Upper computer for a vending machine controller")]
pub struct ArgsParser {
    #[arg(
        short,
        long,
        default_value = "config.json",
        help = "path to the JSON configuration file"
    )]
    pub config: PathBuf,
}
