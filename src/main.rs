use std::process::exit;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use siglent_sds_rs::session::{AnalogPacket, LogicPacket, SessionSink};
use siglent_sds_rs::sim::SimulatedScope;
use siglent_sds_rs::{logging, models, AcquisitionEngine, DataSource, TickStatus};

#[derive(Parser, Debug)]
#[command(name = "sds-demo", about = "Run a simulated SDS capture and print the decoded data")]
struct Args {
    /// Scope model to simulate (e.g. SDS1204X-E, SDS2304X, SDS1102CML)
    #[arg(long, default_value = "SDS1204X-E")]
    model: String,
    /// Number of frames to capture (history source only; 0 = all recorded)
    #[arg(long, default_value_t = 1)]
    frames: u64,
    /// Capture source
    #[arg(long, value_enum, default_value = "screen")]
    source: Source,
    /// Analog channels to enable (zero-based)
    #[arg(long, value_delimiter = ',', default_value = "0")]
    channels: Vec<usize>,
    /// Memory depth in samples
    #[arg(long, default_value_t = 1400)]
    depth: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Source {
    Screen,
    History,
    Readonly,
}

impl From<Source> for DataSource {
    fn from(source: Source) -> Self {
        match source {
            Source::Screen => DataSource::Screen,
            Source::History => DataSource::History,
            Source::Readonly => DataSource::ReadOnly,
        }
    }
}

/// Prints a one-line summary per packet.
#[derive(Default)]
struct ConsoleSink {
    frame: u64,
}

impl SessionSink for ConsoleSink {
    fn send_frame_begin(&mut self) {
        self.frame += 1;
        println!("--- frame {} ---", self.frame);
    }

    fn send_frame_end(&mut self) {
        println!("--- frame {} end ---", self.frame);
    }

    fn send_analog(&mut self, packet: AnalogPacket) {
        let head: Vec<f32> = packet.samples.iter().take(8).copied().collect();
        println!(
            "{}: {} samples (digits={}) {:?}...",
            packet.channel,
            packet.samples.len(),
            packet.meaning.digits,
            head
        );
    }

    fn send_logic(&mut self, packet: LogicPacket) {
        println!(
            "logic: {} samples x {} bytes",
            packet.data.len() / packet.unit_size,
            packet.unit_size
        );
    }

    fn send_end(&mut self) {
        println!("--- end ---");
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    logging::init_rust_logging();
    let args = Args::parse();

    let model = models::lookup(&args.model)
        .with_context(|| format!("unknown model {:?}", args.model))?;
    println!(
        "Simulating {} ({:?}, {} channels)",
        model.name, model.family, model.analog_channels
    );

    let scope = SimulatedScope::new(model);
    scope.set_memory_depth(args.depth);
    for &ch in &args.channels {
        if ch >= model.analog_channels {
            anyhow::bail!("channel {ch} out of range for {}", model.name);
        }
        scope.set_channel(ch, true, 1.0, 0.0);
    }
    match args.source {
        Source::History => {
            // Seed a few recorded frames and leave the scope stopped, as it
            // would be after a real run.
            let frames = args.frames.max(1) as usize;
            scope.set_history(vec![vec![None; model.analog_channels]; frames]);
            scope.set_trigger_mode("STOP");
        }
        Source::Readonly => scope.set_trigger_mode("STOP"),
        Source::Screen => {}
    }

    let mut engine = AcquisitionEngine::new(
        model,
        Box::new(scope.clone()),
        Box::new(ConsoleSink::default()),
    );
    engine.start_acquisition(args.frames, args.source.into())?;
    if let Some(config) = engine.config() {
        println!(
            "timebase {}s/div, {} samples, {:.0} Sa/s",
            config.timebase, config.memory_depth_analog, config.samplerate
        );
    }
    while engine.tick()? == TickStatus::NeedIo {}
    println!("Done.");
    Ok(())
}
