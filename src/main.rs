//! # Cyclone
//!
//! Cyclone is the device core of a compositor. It owns the GPUs and
//! display hardware of a seat and keeps them fed:
//!
//! * `session` - talks to logind to get (and give back) the DRM devices
//!   of our seat, and tracks when we are switched away from.
//! * `enumerate` - finds the display devices and the outputs they drive,
//!   and matches them with Vulkan physical devices.
//! * `squall` - the Vulkan half. Device selection, queues, render
//!   targets and deferred destruction of GPU resources.
//!
//! Setting `WAYLAND_DISPLAY` runs nested instead of taking over the seat.

// Austin Shafer - 2024
extern crate utils;

mod cyclone;
use cyclone::Cyclone;

use std::time::SystemTime;

fn main() -> utils::Result<()> {
    utils::logging::init();

    let mut storm = Cyclone::spin()?;

    println!("Begin render loop...");
    let start = SystemTime::now();
    storm.run_forever()?;
    let end = SystemTime::now();

    println!(
        "uptime: {}",
        end.duration_since(start)
            .map(|d| d.as_secs_f32())
            .unwrap_or(0.0)
    );
    Ok(())
}
