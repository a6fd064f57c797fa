use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use emberdb::{Error, Store};

/// Persistent key/value store with snapshot-isolated transactions.
///
/// Each command runs in its own single-statement transaction. Without a
/// command, an interactive prompt accepts the same operations line by line.
#[derive(Parser)]
#[command(name = "emberdb", version)]
struct Cli {
    /// Pool file backing the store (created if missing).
    pool: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Insert or update a key.
    W { key: String, value: String },
    /// Read the value of a key.
    R { key: String },
    /// Remove a key.
    D { key: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let store = match Store::open(&cli.pool) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: cannot open {}: {e}", cli.pool.display());
            return ExitCode::FAILURE;
        }
    };

    let status = match cli.command {
        Some(command) => run_command(&store, &command),
        None => repl(&store),
    };

    if let Err(e) = store.close() {
        eprintln!("error: close failed: {e}");
        return ExitCode::FAILURE;
    }
    status
}

/// Runs one operation in its own transaction.
fn run_command(store: &Store, command: &Command) -> ExitCode {
    let tx = store.begin();
    let outcome = match command {
        Command::W { key, value } => store
            .write(&tx, key.as_bytes(), value.as_bytes())
            .map(|()| None),
        Command::R { key } => store.read(&tx, key.as_bytes()).map(Some),
        Command::D { key } => store.delete(&tx, key.as_bytes()).map(|()| None),
    };

    let result = outcome.and_then(|value| {
        store.commit(&tx)?;
        Ok(value)
    });

    match result {
        Ok(Some(value)) => {
            println!("{}", String::from_utf8_lossy(&value));
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn repl(store: &Store) -> ExitCode {
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let command = match tokens.as_slice() {
            [] => continue,
            ["q"] => return ExitCode::SUCCESS,
            ["w", key, value] => Command::W {
                key: (*key).into(),
                value: (*value).into(),
            },
            ["r", key] => Command::R { key: (*key).into() },
            ["d", key] => Command::D { key: (*key).into() },
            _ => {
                eprintln!("commands: w KEY VALUE | r KEY | d KEY | q");
                continue;
            }
        };
        run_command(store, &command);
    }
}

fn report(e: &Error) {
    match e.code() {
        Some(code) => eprintln!("error: {e} (status {code})"),
        None => eprintln!("error: {e}"),
    }
}
