// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! Shared command line behaviors for the depfs binary

use tracing_subscriber::prelude::*;

const DEPFS_LOG: &str = "DEPFS_LOG";

pub fn configure_logging(verbosity: u8) {
    let mut config = match verbosity {
        0 => {
            if let Ok(existing) = std::env::var(DEPFS_LOG) {
                existing
            } else {
                "depfs=info,depfs_vfs=info,warn".to_string()
            }
        }
        1 => "depfs=debug,depfs_vfs=debug,info".to_string(),
        2 => "depfs=trace,depfs_vfs=trace,info".to_string(),
        3 => "depfs=trace,depfs_vfs=trace,debug".to_string(),
        _ => "trace".to_string(),
    };
    std::env::set_var(DEPFS_LOG, &config);
    if let Ok(overrides) = std::env::var("RUST_LOG") {
        config.push(',');
        config.push_str(&overrides);
    }
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let registry = tracing_subscriber::Registry::default().with(env_filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(verbosity > 2);
    tracing::subscriber::set_global_default(registry.with(fmt_layer)).unwrap();
}
