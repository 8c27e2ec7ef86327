//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bfdd", version, about = "BFD session daemon")]
pub struct Cli {
    /// Initial peer configuration document (JSON), re-read on SIGHUP.
    #[arg(short, long, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Unix domain control socket path.
    #[arg(short = 's', long, value_name = "path", default_value = Cli::DFLT_CONTROL_SOCKET)]
    pub control_socket: PathBuf,
}

impl Cli {
    pub const DFLT_CONTROL_SOCKET: &'static str = "/var/run/bfdd.sock";
}
