use clap::{Parser, Subcommand};
use std::process::{Command, Stdio};

#[derive(Parser)]
#[command(name = "cardroom-combined")]
#[command(about = "Cardroom - server and client launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the table server
    Server {
        #[arg(short, long, default_value = "9001")]
        port: u16,
        /// Seed the `demo` table and print credentials for it
        #[arg(long)]
        demo: bool,
        /// Verbose server logs
        #[arg(long)]
        debug: bool,
    },
    /// Run the terminal client against a game url
    Client {
        /// e.g. ws://127.0.0.1:9001/ws/demo?token=...
        url: String,
        /// Session cookie value, sent as `Cookie: cardroom_session=<id>`
        #[arg(long)]
        session: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let ok = match cli.command {
        Commands::Server { port, demo, debug } => run_server(port, demo, debug),
        Commands::Client { url, session } => run_client(&url, session.as_deref()),
    };
    if !ok {
        std::process::exit(1);
    }
}

fn run(what: &str, cmd: &mut Command) -> bool {
    let status = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    match status {
        Ok(exit_status) if exit_status.success() => true,
        Ok(exit_status) => {
            eprintln!("❌ {what} exited with error: {exit_status}");
            false
        }
        Err(e) => {
            eprintln!("❌ Failed to start {what}: {e}");
            false
        }
    }
}

fn run_server(port: u16, demo: bool, debug: bool) -> bool {
    println!("📡 Starting cardroom server on port {port}...");
    let mut cmd = Command::new("cargo");
    cmd.args(["run", "-p", "cardroom-server", "--"]).env("PORT", port.to_string());
    if demo {
        cmd.arg("--demo");
    }
    if debug {
        cmd.arg("--debug");
    }
    run("server", &mut cmd)
}

fn run_client(url: &str, session: Option<&str>) -> bool {
    let mut cmd = Command::new("cargo");
    cmd.args(["run", "--bin", "cli_client", "--", url]);
    if let Some(s) = session {
        cmd.args(["--session", s]);
    }
    run("client", &mut cmd)
}
