use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use vigil_lib::commands::{self, Enrollment};
use vigil_lib::config::{default_config_path, Config};
use vigil_lib::session::StorageLayout;

/// Vigil - watches video sources for unknown faces and keeps clips of each visit
#[derive(Parser, Debug)]
#[command(name = "vigil", version, long_about = None)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open every configured source and record until Ctrl+C
    Run,

    /// Enroll the single face in a reference image
    Enroll {
        name: String,
        image: PathBuf,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        gender: Option<String>,
    },

    /// List enrolled identities
    Identities,

    /// Change the name, age or gender of an enrolled identity
    UpdateIdentity {
        id: i64,
        name: String,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        gender: Option<String>,
    },

    /// Remove an enrolled identity
    Revoke { id: i64 },

    /// Show the most recent recordings
    Recordings {
        #[arg(long)]
        camera: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Summarize a persisted frame archive
    InspectArchive { file: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    vigil_lib::init_logging();

    if let Err(e) = execute(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn execute(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path);
    let layout = StorageLayout::new(&config.storage_path);

    match cli.command {
        Command::Run => vigil_lib::run(&config_path),
        Command::Enroll { name, image, age, gender } => {
            let log = vigil_lib::open_event_log(&layout)?;
            let detector = commands::enrollment_detector(&config.detector)?;
            let face = commands::enroll_from_image(
                &detector,
                &log,
                &layout.faces_dir(),
                &Enrollment {
                    name: &name,
                    age,
                    gender: gender.as_deref(),
                    image: &image,
                },
            )?;
            emit(cli.json, &face, || println!("Enrolled {} as identity {}", face.name, face.id))
        }
        Command::Identities => {
            let faces = vigil_lib::open_event_log(&layout)?.list_faces()?;
            emit(cli.json, &faces, || {
                if faces.is_empty() {
                    println!("No enrolled identities");
                }
                for face in &faces {
                    println!(
                        "{:>4}  {:<24} age {:<4} {:<8} {}",
                        face.id,
                        face.name,
                        face.age.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
                        face.gender.as_deref().unwrap_or("-"),
                        face.image_path
                    );
                }
            })
        }
        Command::UpdateIdentity { id, name, age, gender } => {
            let log = vigil_lib::open_event_log(&layout)?;
            let face = commands::update_identity(&log, id, &name, age, gender.as_deref())?;
            emit(cli.json, &face, || println!("Updated identity {} ({})", face.id, face.name))
        }
        Command::Revoke { id } => {
            let log = vigil_lib::open_event_log(&layout)?;
            let face = commands::revoke_identity(&log, &layout.faces_dir(), id)?;
            emit(cli.json, &face, || println!("Revoked identity {} ({})", face.id, face.name))
        }
        Command::Recordings { camera, limit } => {
            let log = vigil_lib::open_event_log(&layout)?;
            let entries = commands::recent_recordings(&log, camera.as_deref(), limit)?;
            emit(cli.json, &entries, || {
                if entries.is_empty() {
                    println!("No recordings");
                }
                for entry in &entries {
                    println!(
                        "{}  {} -> {}  {:<16} {}",
                        entry.id, entry.start_time, entry.end_time, entry.camera_name, entry.file_path
                    );
                }
            })
        }
        Command::InspectArchive { file } => {
            let summary = commands::inspect_archive(&file)?;
            emit(cli.json, &summary, || {
                println!("{}", summary.path.display());
                println!("  frames: {} ({} pixel bytes)", summary.frames, summary.pixel_bytes);
                let sizes: Vec<String> = summary
                    .dimensions
                    .iter()
                    .map(|(w, h)| format!("{}x{}", w, h))
                    .collect();
                println!("  sizes:  {}", sizes.join(", "));
                for day in &summary.dates {
                    println!(
                        "  {}  {:>7} frames  {} - {}",
                        day.date,
                        day.frames,
                        day.first.format("%H:%M:%S"),
                        day.last.format("%H:%M:%S")
                    );
                }
            })
        }
    }
}

/// JSON when asked for, otherwise the plain rendering
fn emit<T: Serialize>(json: bool, value: &T, plain: impl FnOnce()) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        plain();
    }
    Ok(())
}
