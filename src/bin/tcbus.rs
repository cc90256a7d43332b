use clap::{App, Arg, SubCommand};
use colored::*;
use std::time::Duration;
use tcbus::bridge::TaskId;
use tcbus::link::{PacketConn, PORT_PING, PORT_UPTIME};
use tcbus::packet::CmdPacket;
use tcbus::subservice::GeneralCommand;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ROUTER_PORT: &str = "4800";
const DEFAULT_GENERAL_PORT: &str = "4811";
const REPLY_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("tcbus")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("🛰️  Ground client for the telecommand dispatch node")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Node host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("router-port")
                .long("router-port")
                .value_name("PORT")
                .help("Router (transport services) TCP port")
                .takes_value(true)
                .default_value(DEFAULT_ROUTER_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("general-port")
                .long("general-port")
                .value_name("PORT")
                .help("General command service TCP port")
                .takes_value(true)
                .default_value(DEFAULT_GENERAL_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Ping the transport's built-in service"))
        .subcommand(SubCommand::with_name("uptime").about("⏱️  Query node uptime"))
        .subcommand(
            SubCommand::with_name("reboot")
                .about("♻️  Reboot the node into a partition")
                .arg(
                    Arg::with_name("partition")
                        .help("Reboot partition selector")
                        .required(true)
                        .possible_values(&["A", "B", "G"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("set-delay")
                .about("Set a task's periodic delay")
                .arg(Arg::with_name("task").help("Task handle").required(true))
                .arg(Arg::with_name("delay-ms").help("Delay in milliseconds").required(true)),
        )
        .subcommand(
            SubCommand::with_name("get-delay")
                .about("Read a task's periodic delay")
                .arg(Arg::with_name("task").help("Task handle").required(true)),
        )
        .subcommand(SubCommand::with_name("tasks").about("📋 List live scheduler tasks"))
        .subcommand(
            SubCommand::with_name("watermark")
                .about("Read a task's stack high watermark")
                .arg(Arg::with_name("task").help("Task handle").required(true)),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap().to_string();
    let router_port = matches.value_of("router-port").unwrap().parse::<u16>()?;
    let general_port = matches.value_of("general-port").unwrap().parse::<u16>()?;
    let json = matches.value_of("format").unwrap() == "json";

    match matches.subcommand() {
        ("ping", _) => handle_ping(&host, router_port, json).await?,
        ("uptime", _) => handle_uptime(&host, router_port, json).await?,
        ("reboot", Some(sub)) => {
            let selector = sub.value_of("partition").unwrap().as_bytes()[0];
            let reply =
                send_general(&host, general_port, GeneralCommand::Reboot { selector }).await?;
            report_status(
                "Reboot",
                &format!("partition {}", selector as char),
                &reply,
                json,
            );
        }
        ("set-delay", Some(sub)) => {
            let task = TaskId(sub.value_of("task").unwrap().parse()?);
            let delay_ms: u32 = sub.value_of("delay-ms").unwrap().parse()?;
            let reply =
                send_general(&host, general_port, GeneralCommand::SetTaskDelay { task, delay_ms })
                    .await?;
            report_status("Set delay", &format!("task {} -> {} ms", task.0, delay_ms), &reply, json);
        }
        ("get-delay", Some(sub)) => {
            let task = TaskId(sub.value_of("task").unwrap().parse()?);
            let reply =
                send_general(&host, general_port, GeneralCommand::GetTaskDelay { task }).await?;
            report_u32("Delay", "ms", &reply, json)?;
        }
        ("tasks", _) => {
            let reply = send_general(&host, general_port, GeneralCommand::GetTaskList).await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": reply.status(),
                        "tasks": String::from_utf8_lossy(reply.out_data()),
                    })
                );
            } else {
                println!("{}", "📋 Scheduler tasks".bright_blue().bold());
                print!("{}", String::from_utf8_lossy(reply.out_data()));
            }
        }
        ("watermark", Some(sub)) => {
            let task = TaskId(sub.value_of("task").unwrap().parse()?);
            let reply =
                send_general(&host, general_port, GeneralCommand::GetTaskWatermark { task })
                    .await?;
            report_u32("Stack watermark", "words", &reply, json)?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the node", "cargo run --bin tcbus-node".bright_cyan());
            println!("  {} Test the link", "tcbus ping".bright_cyan());
            println!("  {} List tasks", "tcbus tasks".bright_cyan());
        }
    }

    Ok(())
}

async fn connect(host: &str, port: u16) -> Result<PacketConn, Box<dyn std::error::Error>> {
    match PacketConn::connect((host, port)).await {
        Ok(conn) => Ok(conn),
        Err(e) => {
            eprintln!(
                "{} Failed to connect to {}:{}",
                "❌".red(),
                host.bright_white(),
                port
            );
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Node is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin tcbus-node".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn send_general(
    host: &str,
    port: u16,
    command: GeneralCommand,
) -> Result<CmdPacket, Box<dyn std::error::Error>> {
    let mut conn = connect(host, port).await?;
    conn.send_packet(command.to_request()?).await?;
    conn.read_packet_timeout(REPLY_WAIT)
        .await
        .ok_or_else(|| "no reply from node within 5 seconds".into())
}

async fn handle_ping(host: &str, port: u16, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = connect(host, port).await?;
    conn.send_packet(CmdPacket::from_bytes(PORT_PING, b"tcbus")?).await?;
    match conn.read_packet_timeout(REPLY_WAIT).await {
        Some(echo) if echo.as_bytes() == b"tcbus" => {
            if json {
                println!("{}", serde_json::json!({ "ping": "ok" }));
            } else {
                println!("{} {}", "✅".green(), "Node is responsive".bright_green());
            }
        }
        _ => {
            println!("{} {}", "❌".red(), "Ping failed".bright_red());
        }
    }
    Ok(())
}

async fn handle_uptime(host: &str, port: u16, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = connect(host, port).await?;
    conn.send_packet(CmdPacket::from_bytes(PORT_UPTIME, &[])?).await?;
    let reply = conn
        .read_packet_timeout(REPLY_WAIT)
        .await
        .ok_or("no uptime reply within 5 seconds")?;
    let secs = u32::from_le_bytes(reply.as_bytes().try_into()?);
    if json {
        println!("{}", serde_json::json!({ "uptime_seconds": secs }));
    } else {
        println!("{} Node uptime: {}s", "⏱️".bright_blue(), secs.to_string().bright_cyan());
    }
    Ok(())
}

fn report_status(action: &str, detail: &str, reply: &CmdPacket, json: bool) {
    let status = reply.status().unwrap_or(-128);
    if json {
        println!("{}", serde_json::json!({ "action": action, "status": status }));
        return;
    }
    if status == 0 {
        println!("{} {}: {}", "✅".green(), action.bright_white(), detail.bright_cyan());
    } else {
        println!(
            "{} {} rejected (status {})",
            "❌".red(),
            action.bright_white(),
            status.to_string().bright_red()
        );
    }
}

fn report_u32(
    label: &str,
    unit: &str,
    reply: &CmdPacket,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let value = u32::from_le_bytes(reply.out_data().try_into()?);
    if json {
        println!(
            "{}",
            serde_json::json!({ "status": reply.status(), "value": value, "unit": unit })
        );
    } else {
        println!(
            "{} {}: {} {}",
            "📊".bright_blue(),
            label.bright_white(),
            value.to_string().bright_cyan(),
            unit
        );
    }
    Ok(())
}
