//! Sensor bench tool
//!
//! Opens both range sensors with the service configuration, prints raw
//! samples from each, then the baseline the service would calibrate.
//! Useful when mounting sensors or checking wiring.

use clap::Parser;
use door_counter::domain::SensorId;
use door_counter::infra::Config;
use door_counter::io::{SensorSource, SerialRangeSource};
use door_counter::services::baseline;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "sensor-test", about = "Print raw range samples and baselines")]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/door.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Raw samples to print per sensor
    #[arg(short = 'n', long, default_value = "20")]
    samples: usize,

    /// Delay between samples (ms)
    #[arg(long, default_value = "100")]
    interval_ms: u64,

    /// Only this sensor (outside|inside)
    #[arg(long)]
    sensor: Option<String>,
}

fn parse_sensor(name: &str) -> anyhow::Result<SensorId> {
    match name {
        "outside" | "0" => Ok(SensorId::Outside),
        "inside" | "1" => Ok(SensorId::Inside),
        other => anyhow::bail!("unknown sensor '{}', expected outside or inside", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    let sensors = match args.sensor.as_deref() {
        Some(name) => vec![parse_sensor(name)?],
        None => SensorId::ALL.to_vec(),
    };

    let mut source = SerialRangeSource::new(&config);
    let interval = Duration::from_millis(args.interval_ms);

    for &sensor in &sensors {
        println!("=== {} sensor ({}) ===", sensor, source.device(sensor));
        let mut ok = 0usize;
        for i in 0..args.samples {
            let started = Instant::now();
            match source.read(sensor).await {
                Ok(distance) => {
                    ok += 1;
                    println!(
                        "[{:3}] {:>6}  ({:.1}ms)",
                        i,
                        distance.to_string(),
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                }
                Err(e) => println!("[{:3}] ERROR {}", i, e),
            }
            tokio::time::sleep(interval).await;
        }
        println!("{}/{} reads ok", ok, args.samples);
    }

    println!();
    for &sensor in &sensors {
        match baseline::calibrate(
            &mut source,
            sensor,
            config.baseline_samples(),
            config.baseline_interval(),
        )
        .await
        {
            Ok(baseline) => println!(
                "{} baseline: {} (trigger below {}mm)",
                sensor,
                baseline,
                baseline.mm().saturating_sub(config.tolerance_mm())
            ),
            Err(e) => println!("{} baseline: FAILED ({:#})", sensor, e),
        }
    }

    Ok(())
}
