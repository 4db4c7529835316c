mod agent;
mod cli;
mod controller;
mod protocol;
mod session;

use anyhow::Result;
use cli::{Cli, Commands};
use controller::receive::StreamEvent;
use controller::Controller;
use protocol::{Command, MonitorRequest};
use session::ConnectionState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::Agent { bind, downloads } => {
            let download_dir =
                downloads.unwrap_or_else(agent::transfer::default_download_dir);
            agent::run(agent::AgentConfig { bind, download_dir }).await?;
        }
        Commands::Connect { addr } => {
            run_console(&addr).await?;
        }
    }

    Ok(())
}

enum ConsoleFlow {
    Continue,
    Quit,
}

async fn run_console(addr: &str) -> Result<()> {
    let mut controller = Controller::new();
    println!("🔌 Connecting to {addr}...");
    controller.connect(addr).await?;
    println!("✅ Connected. Type a shell command, or /help for directives.");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        match handle_line(&mut controller, &line).await {
            Ok(ConsoleFlow::Continue) => {}
            Ok(ConsoleFlow::Quit) => break,
            Err(e) => println!("❌ {e:#}"),
        }

        if controller.state() == ConnectionState::Disconnected {
            println!("Connection lost.");
            break;
        }
    }

    controller.disconnect().await;
    Ok(())
}

async fn handle_line(controller: &mut Controller, line: &str) -> Result<ConsoleFlow> {
    if !line.starts_with('/') {
        // Shell command. During streaming the reply arrives as an event.
        if controller.state() == ConnectionState::Streaming {
            controller.send(line).await?;
        } else {
            println!("{}", controller.send_command(line).await?);
        }
        return Ok(ConsoleFlow::Continue);
    }

    let mut parts = line.splitn(2, ' ');
    let directive = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    match directive {
        "/help" => print_help(),
        "/quit" => return Ok(ConsoleFlow::Quit),
        "/exit" => {
            println!("{}", controller.send_command(&Command::Exit.encode()).await?);
            return Ok(ConsoleFlow::Quit);
        }
        "/lock" => send_directive(controller, &Command::LockInput.encode()).await?,
        "/unlock" => send_directive(controller, &Command::UnlockInput.encode()).await?,
        "/netoff" => send_directive(controller, &Command::DisableNet.encode()).await?,
        "/neton" => send_directive(controller, &Command::EnableNet.encode()).await?,
        "/popup" => {
            send_directive(controller, &Command::Popup(rest.to_string()).encode()).await?
        }
        "/send" => {
            if rest.is_empty() {
                println!("Usage: /send <path>");
            } else {
                println!("{}", controller.send_file(std::path::Path::new(rest)).await?);
            }
        }
        "/monitor" => {
            let request = parse_monitor_args(rest)?;
            let handles = controller.start_monitor(request).await?;
            spawn_stream_printers(handles);
            println!("📺 Monitoring. /stop to end.");
        }
        "/stop" => {
            controller.stop_monitor().await?;
            println!("📺 Monitor stopped.");
        }
        other => println!("Unknown directive {other}. /help lists them."),
    }

    Ok(ConsoleFlow::Continue)
}

/// Directives work during streaming too; their replies then arrive as
/// stream events instead of a direct response.
async fn send_directive(controller: &mut Controller, encoded: &str) -> Result<()> {
    if controller.state() == ConnectionState::Streaming {
        controller.send(encoded).await?;
    } else {
        println!("{}", controller.send_command(encoded).await?);
    }
    Ok(())
}

fn parse_monitor_args(rest: &str) -> Result<MonitorRequest> {
    let mut request = MonitorRequest {
        width: 1280,
        height: 720,
        fps: 10,
        quality: 50,
        delay: 0.5,
    };
    if rest.is_empty() {
        return Ok(request);
    }

    let args: Vec<&str> = rest.split_whitespace().collect();
    if args.len() != 5 {
        anyhow::bail!("usage: /monitor [width height fps quality delay]");
    }
    request.width = args[0].parse()?;
    request.height = args[1].parse()?;
    request.fps = args[2].parse()?;
    request.quality = args[3].parse()?;
    request.delay = args[4].parse()?;
    Ok(request)
}

/// Print stream traffic in the background while the console stays usable.
fn spawn_stream_printers(handles: controller::StreamHandles) {
    let mut events = handles.events;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Text(text) => println!("📨 {text}"),
                StreamEvent::Disconnected => {
                    println!("📡 Stream ended by the agent.");
                    break;
                }
            }
        }
    });

    let mut frames = handles.frames;
    tokio::spawn(async move {
        let mut count: u64 = 0;
        while let Some(frame) = frames.recv().await {
            count += 1;
            // Every frame would flood the console; show a heartbeat.
            if count == 1 || count % 30 == 0 {
                println!("🖼  frame #{count}: {}x{}", frame.width, frame.height);
            }
        }
    });
}

fn print_help() {
    println!("Directives:");
    println!("  /monitor [w h fps quality delay]  start screen monitoring");
    println!("  /stop                             stop screen monitoring");
    println!("  /lock | /unlock                   block or release input devices");
    println!("  /netoff | /neton                  disable or enable network adapters");
    println!("  /popup <message>                  show a message on the agent");
    println!("  /send <path>                      upload a file to the agent");
    println!("  /exit                             shut the agent down");
    println!("  /quit                             leave the console");
    println!("Anything else runs as a shell command on the agent.");
}
