//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::path::Path;

use tracing_subscriber::prelude::*;

// Installs the global tracing subscriber: an `EnvFilter` defaulting to
// `info` (overridable via `RUST_LOG`), a stdout `fmt` layer, and an
// optional daily-rotating file layer. Mirrors `holo-daemon::main::
// init_tracing`, minus the journald/tokio-console layers this daemon has
// no use for.
pub fn init(log_dir: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("info".parse().unwrap())
        .from_env_lossy();

    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    let file = log_dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "bfdd.log");
        tracing_subscriber::fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(file)
        .init();
}
