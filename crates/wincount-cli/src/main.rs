//! wincount CLI - simulates windows and inspects the shared window counter

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::debug;
use wincount_host::{HostStatus, WindowHost};
use wincount_shared::{
    ChangeListener, ChannelPoster, EVENT_NAME, REGION_NAME, Scope, SharedCounter, SyncConfig,
};

#[derive(Parser)]
#[command(name = "wincount")]
#[command(about = "Shared window counter - keeps every window process in sync")]
#[command(version)]
struct Args {
    /// Base name of the shared counter region
    #[arg(long, env = "WINCOUNT_REGION", default_value = REGION_NAME, global = true)]
    region: String,

    /// Base name of the change event
    #[arg(long, env = "WINCOUNT_EVENT", default_value = EVENT_NAME, global = true)]
    event: String,

    /// Share the counter machine-wide instead of per session
    #[arg(long, global = true)]
    global: bool,

    /// Delay between waking on a change and resetting the event
    #[arg(long, env = "WINCOUNT_GRACE_MS", default_value_t = 10, global = true)]
    grace_ms: u64,

    /// Upper bound of one listener wait
    #[arg(long, env = "WINCOUNT_WAIT_MS", default_value_t = 500, global = true)]
    wait_ms: u64,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulated window until Enter is pressed or its lifetime ends
    Window {
        /// Close the window after this many milliseconds
        #[arg(long)]
        lifetime_ms: Option<u64>,
    },
    /// Print every change of the window count
    Watch {
        /// Exit after this many changes
        #[arg(long)]
        changes: Option<usize>,
        /// Exit after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Count one more window
    Inc,
    /// Count one window less
    Dec,
    /// Print the current window count
    Read,
}

impl Args {
    fn config(&self) -> SyncConfig {
        let scope = if self.global {
            Scope::Global
        } else {
            Scope::Session
        };
        SyncConfig::with_names(&self.region, &self.event)
            .with_scope(scope)
            .with_reset_grace(Duration::from_millis(self.grace_ms))
            .with_wait_timeout(Duration::from_millis(self.wait_ms.max(1)))
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.config();
    debug!(
        region = %config.region_object_name(),
        event = %config.event_object_name(),
        "resolved object names"
    );

    match args.command {
        Command::Window { lifetime_ms } => run_window(config, lifetime_ms.map(Duration::from_millis)),
        Command::Watch {
            changes,
            timeout_ms,
        } => run_watch(&config, changes, timeout_ms.map(Duration::from_millis)),
        Command::Inc => run_once(&config, |counter| counter.increment().map_err(Into::into)),
        Command::Dec => run_once(&config, |counter| counter.decrement().map_err(Into::into)),
        Command::Read => run_once(&config, |counter| Ok(counter.read())),
    }
}

/// Library logs go to stderr so stdout carries only status lines
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .with_max_level(if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("{} Failed to set up logging: {}", "[WARN]".yellow(), e);
    }
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("{} {}", "[ERROR]".red(), message);
    ExitCode::FAILURE
}

/// One window: counted while it lives, printing every count it is sent
fn run_window(config: SyncConfig, lifetime: Option<Duration>) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return fail(format!("Failed to start runtime: {e}")),
    };

    let mut host = WindowHost::new(config, ChannelPoster::new());
    match host.on_create() {
        HostStatus::Synced => println!("{} Window opened", "[OK]".green()),
        HostStatus::Degraded => println!(
            "{} Window opened without cross-process sync",
            "[WARN]".yellow()
        ),
    }

    let (mailbox, mut inbox) = host.bridge().poster().open_mailbox();
    host.register_mailbox(mailbox);

    // Enter closes the window; a closed stdin does not
    let (enter_tx, mut enter_rx) = tokio::sync::oneshot::channel::<()>();
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            let _ = enter_tx.send(());
        }
    });

    runtime.block_on(async {
        let deadline = async {
            match lifetime {
                Some(lifetime) => tokio::time::sleep(lifetime).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut stdin_open = true;
        loop {
            tokio::select! {
                Some(count) = inbox.recv() => println!("{} {}", "[COUNT]".cyan(), count),
                enter = &mut enter_rx, if stdin_open => match enter {
                    Ok(()) => break,
                    Err(_) => stdin_open = false,
                },
                () = &mut deadline => break,
            }
        }
    });

    host.unregister_mailbox(mailbox);
    match host.on_destroy() {
        Some(remaining) => println!(
            "{} Window closed, {} remaining",
            "[OK]".green(),
            remaining
        ),
        None => println!("{} Window closed", "[OK]".green()),
    }
    ExitCode::SUCCESS
}

/// Print changes of the count until enough were seen or the timeout hits
fn run_watch(config: &SyncConfig, changes: Option<usize>, timeout: Option<Duration>) -> ExitCode {
    let counter = match SharedCounter::open(config) {
        Ok(counter) => Arc::new(counter),
        Err(e) => return fail(e),
    };

    let (tx, rx) = mpsc::channel();
    let mut listener = ChangeListener::new(config, counter.clone());
    listener.set_callback(move |count| {
        println!("{} {}", "[CHANGE]".cyan(), count);
        let _ = tx.send(count);
    });
    if let Err(e) = listener.start() {
        return fail(e);
    }

    println!(
        "{} Watching {} (count {})",
        "[READY]".green(),
        counter.name(),
        counter.read()
    );

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut seen = 0usize;
    let reached = loop {
        if changes.is_some_and(|wanted| seen >= wanted) {
            break true;
        }
        let received = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                rx.recv_timeout(left).map_err(|_| ())
            }
            None => rx.recv().map_err(|_| ()),
        };
        match received {
            Ok(_) => seen += 1,
            // Timed out: only a failure if a number of changes was asked for
            Err(()) => break changes.is_none(),
        }
    };

    listener.stop();
    if reached {
        ExitCode::SUCCESS
    } else {
        println!(
            "{} Timed out after {} change(s)",
            "[WARN]".yellow(),
            seen
        );
        ExitCode::FAILURE
    }
}

/// Open the counter, apply `op` and print the resulting count
fn run_once(
    config: &SyncConfig,
    op: impl FnOnce(&SharedCounter) -> Result<i32, Box<dyn std::error::Error>>,
) -> ExitCode {
    let counter = match SharedCounter::open(config) {
        Ok(counter) => counter,
        Err(e) => return fail(e),
    };
    match op(&counter) {
        Ok(count) => {
            println!("{} {}", "[COUNT]".cyan(), count);
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}
