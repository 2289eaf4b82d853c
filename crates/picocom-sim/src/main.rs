use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use picocom_gpu::protocol::BufferArena;
use picocom_sim::{dump_scene, SimConfig, Simulator};

#[derive(Parser)]
#[command(name = "picocom-sim")]
#[command(about = "Run the picocom VDP pipeline on the desktop", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Suppress log output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Render demo frames and write the displayed frame as a PPM image
    Run {
        /// Frames to render
        #[arg(long, default_value = "1")]
        frames: u32,

        /// Output image path
        #[arg(short, long, default_value = "frame.ppm")]
        out: PathBuf,

        /// Command buffers in flight
        #[arg(long, default_value = "2")]
        pool_size: usize,

        /// Arena the sprite is uploaded to
        #[arg(long, value_enum, default_value = "ram")]
        arena: Arena,
    },

    /// Print the decoded command stream of one demo frame
    Dump {
        /// Frame number (moves the sprite)
        #[arg(long, default_value = "0")]
        frame: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Arena {
    Ram,
    Flash,
}

impl From<Arena> for BufferArena {
    fn from(arena: Arena) -> Self {
        match arena {
            Arena::Ram => BufferArena::Ram0,
            Arena::Flash => BufferArena::Flash0,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if !cli.quiet {
        let level = match cli.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        env_logger::Builder::from_default_env().filter_level(level).init();
    }

    let result = match cli.command {
        Commands::Run {
            frames,
            out,
            pool_size,
            arena,
        } => run(frames, out, pool_size, arena),
        Commands::Dump { frame } => dump_scene(frame).map(|listing| print!("{}", listing)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(frames: u32, out: PathBuf, pool_size: usize, arena: Arena) -> picocom_sim::Result<()> {
    let config = SimConfig {
        pool_size,
        sprite_arena: arena.into(),
        ..SimConfig::default()
    };
    let mut sim = Simulator::new(&config);
    let report = sim.run(frames)?;
    sim.write_ppm(&out)?;

    log::info!(
        "{} frames, {} flips, {} overflow stalls, VDP1 {} tiles / {} culled / {} errors",
        report.frames,
        report.flips,
        report.client.overflow_stalls,
        report.vdp1.tiles,
        report.vdp1.culled,
        report.vdp1.errors
    );
    Ok(())
}
