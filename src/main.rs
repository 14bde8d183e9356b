use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use remote_inject::{AttachOptions, Attachment, Library, Process};

/// Inject a shared library into a running process.
#[derive(Parser, Debug)]
#[command(name = "remote-inject", version)]
struct Args {
    /// PID of the process to inject the library into.
    pid: i32,

    /// Path of the library to inject, as the target process resolves it.
    library_path: PathBuf,

    /// Root directory of the target's filesystem, for containerized targets
    /// (e.g. /proc/<pid>/root).
    #[arg(long)]
    process_root: Option<PathBuf>,

    /// Call this exported symbol after the library has loaded.
    #[cfg(unix)]
    #[arg(long, value_name = "SYMBOL")]
    call: Option<String>,

    /// Unload the library again before detaching.
    #[arg(long)]
    uninject: bool,

    /// Bound for each remote call, in milliseconds.
    #[arg(long, default_value_t = 5000, value_name = "MS")]
    timeout_ms: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("remote-inject: {err} (code {})", err.code());
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> remote_inject::Result<()> {
    let process = Process::from_pid(args.pid)?;
    let library = match &args.process_root {
        Some(root) => Library::from_path_in_root(&args.library_path, root)?,
        None => Library::from_path(&args.library_path)?,
    };

    let options =
        AttachOptions::new().remote_call_timeout(Duration::from_millis(args.timeout_ms));
    let mut attachment = Attachment::attach_with_options(process, options)?;
    let outcome = drive(&mut attachment, &library, &args);
    let detached = attachment.detach();
    outcome?;
    detached
}

fn drive(
    attachment: &mut Attachment,
    library: &Library,
    args: &Args,
) -> remote_inject::Result<()> {
    let handle = attachment.inject(library)?;
    println!("injected {} as {:#x}", args.library_path.display(), handle.raw());

    #[cfg(unix)]
    if let Some(symbol) = &args.call {
        attachment.call(&handle, symbol)?;
    }

    if args.uninject {
        attachment.uninject(handle)?;
        println!("unloaded {}", args.library_path.display());
    }
    Ok(())
}
