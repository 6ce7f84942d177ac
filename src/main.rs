//! LX200 bridge daemon.
//!
//! Serves a subset of the LX200 protocol over TCP and drives two independent
//! axis controllers behind it: a SkyWatcher motor controller for RA and an
//! LX200-speaking controller (or a dummy) for DEC.

#[cfg(test)]
#[macro_use]
extern crate assert_float_eq;

mod astro_math;
mod config;
mod dec_backend;
mod errors;
mod lx200;
mod mount;
mod server;
mod skywatcher;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, WrapErr};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::dec_backend::{DecBackend, DummyDec, SerialDecClient};
use crate::mount::Mount;
use crate::skywatcher::{Axis, SkyWatcherMc};
use crate::transport::SerialDevice;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config: Config = confy::load_path("config.toml").wrap_err("reading config.toml")?;
    info!(?config, "configuration loaded");

    let ra_axis = Axis::from_channel(&config.ra.channel).ok_or_else(|| {
        eyre!(
            "bad RA channel {:?} (expected \"1\" or \"2\")",
            config.ra.channel
        )
    })?;
    let ra_dev = SerialDevice::open(
        &config.ra.port,
        config.ra.baud,
        Duration::from_millis(config.ra.timeout_millis),
        "RA",
    )
    .wrap_err_with(|| format!("opening RA serial port {}", config.ra.port))?;
    let ra = SkyWatcherMc::new(Arc::new(ra_dev));

    let dec: Arc<dyn DecBackend> = match &config.dec.port {
        Some(port) => {
            let dev = SerialDevice::open(
                port,
                config.dec.baud,
                Duration::from_millis(config.dec.timeout_millis),
                "DEC",
            )
            .wrap_err_with(|| format!("opening DEC serial port {}", port))?;
            Arc::new(SerialDecClient::new(Arc::new(dev)))
        }
        None => {
            info!("no DEC port configured, using dummy backend");
            Arc::new(DummyDec::default())
        }
    };

    let mount = Arc::new(Mount::new(ra, ra_axis, dec, &config));
    mount.start().await.wrap_err("mount startup failed")?;
    mount.enable_tracking(true).await;

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .wrap_err_with(|| format!("binding {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "LX200 server listening");
    server::serve(listener, mount).await?;
    Ok(())
}
