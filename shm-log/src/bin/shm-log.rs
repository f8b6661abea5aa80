use std::process::ExitCode;

use clap::{Parser, Subcommand};
use shm_log::{Cleanup, Log, LogError, Segment, SegmentName, Shm};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let command = LogCommand::parse();

    match run(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("shm-log: {err}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
struct LogCommand {
    /// The name shared by all processes of the log.
    #[arg(long, default_value = "shm-log")]
    name: String,

    /// The version shared by all processes of the log.
    #[arg(long = "log-version", default_value_t = 0)]
    version: u64,

    /// Keep the segment in place when attaching fails.
    ///
    /// By default, a failed attach removes the segment for every process.
    #[arg(long)]
    preserve: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Create the segment and leave it in place.
    Create {
        #[arg(long, default_value_t = 1024)]
        capacity: usize,
    },
    /// Publish one entry.
    Push {
        id: u64,
        #[arg(default_value = "")]
        text: String,
    },
    /// Print all published entries as `<slot> <id> <text>`.
    Dump,
    /// Print the dimensions of the segment.
    Info,
    /// Remove the segment for all processes.
    Remove,
}

/// The record type of logs handled by this tool.
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Entry {
    id: u64,
    text: [u8; 48],
}

impl Entry {
    fn new(id: u64, text: &str) -> Self {
        let mut entry = Entry { id, text: [0; 48] };
        let len = text.len().min(entry.text.len());
        entry.text[..len].copy_from_slice(&text.as_bytes()[..len]);
        entry
    }

    fn text(&self) -> String {
        let end = self.text.iter().position(|&b| b == 0).unwrap_or(self.text.len());
        String::from_utf8_lossy(&self.text[..end]).into_owned()
    }
}

fn run(command: LogCommand) -> Result<(), LogError> {
    let LogCommand {
        name,
        version,
        preserve,
        action,
    } = command;

    let cleanup = if preserve {
        Cleanup::Preserve
    } else {
        Cleanup::Destroy
    };

    let attached = |capacity| -> Result<Log<Entry>, LogError> {
        let mut log = Log::new(name.as_str(), version, capacity).cleanup(cleanup);
        log.attach()?;
        Ok(log)
    };

    match action {
        Action::Create { capacity } => {
            let mut log = Log::<Entry>::new(name.as_str(), version, capacity).cleanup(cleanup);
            log.create()?;
            println!("created {} with {} slots", name, log.capacity());
            // Dropping a mapped handle would remove the segment again.
            log.close();
        }
        Action::Push { id, text } => {
            let mut log = attached(0)?;
            let index = log.push(Entry::new(id, &text));
            log.close();
            println!("{}", index?);
        }
        Action::Dump => {
            let mut log = attached(0)?;
            {
                let mut reader = log.read_cursor()?;
                while reader.next() {
                    if let Some(entry) = reader.record() {
                        println!("{} {} {}", reader.position(), entry.id, entry.text());
                    }
                }
            }
            log.close();
        }
        Action::Info => {
            let mut log = attached(0)?;
            println!("capacity {}", log.capacity());
            println!("cell_size {}", log.cell_size().unwrap_or(0));
            println!("allocated {}", log.allocated());
            log.close();
        }
        Action::Remove => {
            let name = SegmentName::new(&name, version)?;
            Segment::detach(&Shm::new(), &name)?;
        }
    }

    Ok(())
}
