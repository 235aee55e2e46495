//! Instrumented demo app for trying out zonetrace-capture
//!
//! A fixed-rate "game loop" that simulates, renders and hands physics work
//! to the blocking pool. Workers share a contended [`TracedMutex`], so the
//! capture shows lock waits next to the zones.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example demo-game-loop
//!
//! # In another terminal
//! ./target/release/zonetrace-capture --duration 5 --export trace.json
//! ```
//!
//! Set `ZONETRACE_ON_DEMAND=1` to only record while a collector is attached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use zonetrace::{Config, SourceLocation, TracedMutex};

static WORLD_LOCK: SourceLocation =
    SourceLocation { name: Some("world"), function: "demo_game_loop::main", file: file!(), line: line!(), color: 0 };

const FRAMES: u32 = 600;
const FRAME_BUDGET: Duration = Duration::from_millis(16);

struct World {
    entities: Vec<(f64, f64)>,
}

fn simulate(world: &TracedMutex<World>, steps: usize) {
    let _zone = zonetrace::zone!("physics", color = 0x00aa_44ff);
    for _ in 0..steps {
        let mut world = world.lock();
        for (position, velocity) in &mut world.entities {
            *position += *velocity * 0.016;
            if position.abs() > 100.0 {
                *velocity = -*velocity;
            }
        }
    }
}

fn render(frame: u32, entities: usize) {
    let _zone = zonetrace::zone!("render");
    // Pretend draw calls scale with the entity count
    let mut checksum = 0u64;
    for i in 0..entities * 200 {
        checksum = checksum.wrapping_add(i as u64 ^ u64::from(frame));
    }
    std::hint::black_box(checksum);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let _profiler = zonetrace::init(Config::from_env())?;
    zonetrace::app_info(&format!("demo-game-loop {}", env!("CARGO_PKG_VERSION")));
    zonetrace::set_thread_name("main loop");

    let world = Arc::new(TracedMutex::new(
        World { entities: (0..256).map(|i| (f64::from(i), f64::from(i % 7) - 3.0)).collect() },
        &WORLD_LOCK,
    ));

    println!("demo-game-loop: {FRAMES} frames at ~60 fps, attach zonetrace-capture to watch");

    for frame in 0..FRAMES {
        let started = Instant::now();
        {
            let _zone = zonetrace::zone!("frame");

            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let world = Arc::clone(&world);
                    tokio::task::spawn_blocking(move || simulate(&world, 8))
                })
                .collect();
            for worker in workers {
                worker.await?;
            }

            let entities = world.lock().entities.len();
            render(frame, entities);
            zonetrace::plot!("entities", entities as i64);

            if frame % 60 == 0 {
                zonetrace::message!("second {} done", frame / 60);
            }
        }
        zonetrace::frame_mark!();

        let elapsed = started.elapsed();
        zonetrace::plot!("frame time (ms)", elapsed.as_secs_f64() * 1000.0);
        if let Some(rest) = FRAME_BUDGET.checked_sub(elapsed) {
            tokio::time::sleep(rest).await;
        }
    }

    println!("done, shutting down");
    zonetrace::shutdown();
    Ok(())
}
