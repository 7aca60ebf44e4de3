// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use anyhow::Result;
use clap::{
    Arg,
    ArgMatches,
    Command,
};

//======================================================================================================================
// Program Arguments
//======================================================================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Number of simulated compute units.
    ncus: u32,
    /// Number of clients.
    nclients: usize,
    /// Commands sent by each client.
    ncommands: usize,
    /// Execution time of one command, in microseconds.
    latency_us: u64,
    /// Scheduler configuration file.
    config: Option<String>,
}

impl ProgramArguments {
    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("ncus")
                    .long("ncus")
                    .value_parser(clap::value_parser!(u32))
                    .required(false)
                    .value_name("NUMBER")
                    .default_value("4")
                    .help("Sets number of compute units"),
            )
            .arg(
                Arg::new("nclients")
                    .long("nclients")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("NUMBER")
                    .default_value("2")
                    .help("Sets number of clients"),
            )
            .arg(
                Arg::new("ncommands")
                    .long("ncommands")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("NUMBER")
                    .default_value("1000")
                    .help("Sets number of commands per client"),
            )
            .arg(
                Arg::new("latency")
                    .long("latency")
                    .value_parser(clap::value_parser!(u64))
                    .required(false)
                    .value_name("MICROSECONDS")
                    .default_value("10")
                    .help("Sets execution time of one command"),
            )
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets scheduler configuration file"),
            )
            .get_matches();

        // Number of compute units.
        let ncus: u32 = *matches
            .get_one::<u32>("ncus")
            .ok_or(anyhow::anyhow!("missing ncus"))?;
        if ncus == 0 || ncus as usize > ::kds::runtime::limits::MAX_CUS {
            anyhow::bail!("invalid ncus");
        }

        // Number of clients.
        let nclients: usize = *matches
            .get_one::<usize>("nclients")
            .ok_or(anyhow::anyhow!("missing nclients"))?;
        if nclients == 0 {
            anyhow::bail!("invalid nclients");
        }

        // Commands per client.
        let ncommands: usize = *matches
            .get_one::<usize>("ncommands")
            .ok_or(anyhow::anyhow!("missing ncommands"))?;

        // Command latency.
        let latency_us: u64 = *matches
            .get_one::<u64>("latency")
            .ok_or(anyhow::anyhow!("missing latency"))?;

        // Configuration file.
        let config: Option<String> = matches.get_one::<String>("config").cloned();

        Ok(Self {
            ncus,
            nclients,
            ncommands,
            latency_us,
            config,
        })
    }

    /// Returns the `ncus` command line argument.
    pub fn ncus(&self) -> u32 {
        self.ncus
    }

    /// Returns the `nclients` command line argument.
    pub fn nclients(&self) -> usize {
        self.nclients
    }

    /// Returns the `ncommands` command line argument.
    pub fn ncommands(&self) -> usize {
        self.ncommands
    }

    /// Returns the `latency` command line argument.
    pub fn latency_us(&self) -> u64 {
        self.latency_us
    }

    /// Returns the `config` command line argument.
    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }
}
