// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs the Silo MySQL operator.
//!
//! Hosts two controllers: the cluster controller, which provisions and
//! rotates system-user credentials and maintains MySqlCluster status, and
//! the rollout controller, which walks StatefulSet rolling-update
//! partitions one pod at a time. Prometheus metrics and a liveness probe
//! are served over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::runtime::watcher;
use prometheus::{Registry, TextEncoder};
use tracing::info;
use tracing_subscriber::EnvFilter;

use silo_operatord::controller;
use silo_operatord::metrics::Metrics;

#[derive(clap::Parser)]
#[clap(about = "Silo MySQL cluster operator", long_about = None)]
struct Args {
    /// Listen address for the metrics and health endpoints.
    #[clap(long, default_value = "0.0.0.0:9100")]
    metrics_listen_addr: SocketAddr,

    #[clap(flatten)]
    cluster: controller::cluster::Args,

    #[clap(flatten)]
    rollout: controller::rollout::Args,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Err(err) = run(args).await {
        eprintln!("operatord: fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let registry = Registry::new();
    let metrics = Arc::new(Metrics::register_into(&registry));

    let client = kube::Client::try_default().await?;

    let cluster_controller = k8s_controller::Controller::namespaced_all(
        client.clone(),
        controller::cluster::Context::new(args.cluster, Arc::clone(&metrics)),
        watcher::Config::default(),
    );

    let router = Router::new()
        .route(
            "/metrics",
            get(move || async move {
                let encoder = TextEncoder::new();
                encoder
                    .encode_to_string(&registry.gather())
                    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
            }),
        )
        .route("/livez", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(&args.metrics_listen_addr).await?;
    info!(address = %args.metrics_listen_addr, "serving metrics");
    let http = tokio::spawn(async move { axum::serve(listener, router).await });

    tokio::select! {
        () = cluster_controller.run() => {}
        () = controller::rollout::run(client, args.rollout, metrics) => {}
        result = http => result??,
    }
    anyhow::bail!("a controller unexpectedly exited");
}
