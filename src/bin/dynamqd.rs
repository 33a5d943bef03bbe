// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::process;
use std::sync::Arc;

use clap::Parser;
use dynamq::config::Config;
use dynamq::context::BrokerContext;
use dynamq::error::Error;
use dynamq::listener::Listener;

const DEFAULT_CONFIG: &str = "/etc/dynamq/dynamq.toml";

#[derive(Parser, Debug)]
#[command(name = "dynamqd", version, about = "Clustered MQTT 3.1.1 broker")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Parse and validate the configuration file, then exit without binding.
    #[arg(short = 't', long)]
    test: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("dynamqd: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    let content = std::fs::read_to_string(&cli.config)?;
    let config = Config::from_toml(&content)?;
    config.validate(!cli.test)?;

    if cli.test {
        println!("configuration file {} is valid", cli.config);
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_broker(config))
}

async fn run_broker(config: Config) -> Result<(), Error> {
    let listeners_config = config.listeners().to_vec();

    #[cfg(feature = "cluster")]
    let ctx = if config.cluster().enabled() {
        let client = redis::Client::open(config.cluster().url())?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        let ctx = Arc::new(BrokerContext::new_clustered(config, conn));
        let subscriber_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = dynamq::cluster::subscriber::run_loop(client, subscriber_ctx).await {
                log::error!("cluster: remote event subscriber loop exited: {err:?}");
            }
        });
        ctx
    } else {
        Arc::new(BrokerContext::new_standalone(config))
    };
    #[cfg(not(feature = "cluster"))]
    let ctx = Arc::new(BrokerContext::new_standalone(config));

    let health_ticker = Arc::clone(&ctx.health_ticker);
    tokio::spawn(async move { health_ticker.run_loop().await });

    tokio::spawn(Arc::clone(&ctx).run_cluster_event_loop());

    let mut handles = Vec::with_capacity(listeners_config.len());
    for (index, listener_config) in listeners_config.into_iter().enumerate() {
        let ctx = Arc::clone(&ctx);
        let id = u32::try_from(index).unwrap_or(u32::MAX);
        handles.push(tokio::spawn(async move {
            match Listener::bind(id, listener_config).await {
                Ok(listener) => listener.run_loop(ctx).await,
                Err(err) => log::error!("listener[{id}]: failed to bind: {err:?}"),
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
