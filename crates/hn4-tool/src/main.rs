#![warn(missing_docs)]

//! `hn4` command-line entry point.

use anyhow::Result;
use clap::Parser;
use hn4_tool::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::debug!("hn4 tool starting");

    Cli::parse().run()
}
