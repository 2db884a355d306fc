mod commands;
mod config;
mod message;
mod opcodes;

use std::env;
use std::io::Result;
use std::net::TcpStream;

use commands::*;
use config::Config;
use message::Message;
use opcodes::*;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5672;

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("HA management:");
    eprintln!("  quay-ctl promote                       - Make the connected member the primary");
    eprintln!("  quay-ctl set-client-addresses <url>    - Addresses advertised to clients");
    eprintln!("  quay-ctl set-broker-addresses <url>    - Addresses brokers use to reach each other");
    eprintln!();
    eprintln!("Status:");
    eprintln!("  quay-ctl status                        - Role, addresses and cluster view (JSON)");
    eprintln!("  quay-ctl metrics                       - Server counters (JSON)");
    eprintln!("  quay-ctl ping                          - Members answering on the cluster bus");
    eprintln!();
    eprintln!("Queues (primary only):");
    eprintln!("  quay-ctl declare <queue>");
    eprintln!("  quay-ctl delete <queue>");
    eprintln!("  quay-ctl send <queue> <body>");
    eprintln!("  quay-ctl receive <queue>");
    eprintln!();
    eprintln!("Settings:");
    eprintln!("  quay-ctl config [--host H] [--port P]  - Show or update ~/.quayrc");
    eprintln!();
    eprintln!("Addresses look like amqp:tcp:host:port,tcp:host2:port");
    eprintln!();
    eprintln!("Environment variables (override ~/.quayrc):");
    eprintln!("  QUAY_HOST     - Broker host (default: 127.0.0.1)");
    eprintln!("  QUAY_PORT     - Broker port (default: 5672)");
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn require_arg<'a>(args: &'a [String], index: usize, what: &str) -> &'a str {
    match args.get(index) {
        Some(arg) => arg,
        None => {
            eprintln!("Error: {} requires {}", args[1], what);
            print_usage();
            std::process::exit(1);
        }
    }
}

/// Update ~/.quayrc from `--host` / `--port` flags, then print it.
fn run_config(args: &[String]) -> Result<()> {
    let mut config = Config::load()?;
    let mut changed = false;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                let host = args.get(i + 1).unwrap_or_else(|| fail("--host requires a value"));
                config.host = Some(host.clone());
                changed = true;
                i += 2;
            }
            "--port" => {
                let port = args.get(i + 1).unwrap_or_else(|| fail("--port requires a value"));
                let port = port
                    .parse::<u16>()
                    .unwrap_or_else(|e| fail(&format!("Invalid port number '{}': {}", port, e)));
                config.port = Some(port);
                changed = true;
                i += 2;
            }
            other => fail(&format!("unknown config option '{}'", other)),
        }
    }

    if changed {
        config.save()?;
        println!("Saved {}", Config::path()?.display());
    }
    println!("host = {}", config.host.as_deref().unwrap_or(DEFAULT_HOST));
    println!("port = {}", config.port.unwrap_or(DEFAULT_PORT));
    Ok(())
}

/// Send the CONNECT preamble; exits if the broker refuses the connection.
fn connect(stream: &mut TcpStream, kind: &str) -> Result<()> {
    Message::connect(kind).send(stream)?;

    let response = Message::receive(stream)?;
    match response.code {
        OP_CONNECT_OK => Ok(()),
        OP_EXCLUDED => {
            eprintln!("Connection excluded: {}", response.body);
            std::process::exit(2);
        }
        OP_ERROR => fail(&response.body),
        code => fail(&format!("unexpected response {} to CONNECT", code)),
    }
}

/// Print a reply, exiting non-zero on errors.
fn expect(response: Message, ok: u16) -> Message {
    if response.code == ok {
        return response;
    }
    match response.code {
        OP_ERROR => fail(&response.body),
        code => fail(&format!("unexpected response code {}", code)),
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    if command == COMMAND_CONFIG {
        return run_config(&args[2..]);
    }

    let config = Config::load()?;
    let (host, port) = match config.resolve(env::var("QUAY_HOST").ok(), env::var("QUAY_PORT").ok()) {
        Ok(target) => target,
        Err(e) => fail(&e),
    };

    let mut stream = TcpStream::connect(format!("{}:{}", &host, &port))?;
    connect(&mut stream, connection_kind(command))?;

    if let Some(method) = management_method(command) {
        let argument = if command == COMMAND_PROMOTE {
            ""
        } else {
            require_arg(&args, 2, "<url>")
        };
        Message::manage(method, argument).send(&mut stream)?;

        let response = expect(Message::receive(&mut stream)?, OP_MANAGE_RESULT);
        if response.queue == "0" {
            println!("OK {}", command);
        } else {
            eprintln!("ERR {} (status {}): {}", command, response.queue, response.body);
            std::process::exit(1);
        }
        return Ok(());
    }

    match command {
        COMMAND_STATUS => {
            Message::status().send(&mut stream)?;
            let response = expect(Message::receive(&mut stream)?, OP_STATUS);
            match serde_json::from_str::<serde_json::Value>(&response.body) {
                Ok(value) => println!(
                    "{}",
                    serde_json::to_string_pretty(&value).unwrap_or(response.body)
                ),
                Err(_) => println!("{}", response.body),
            }
        }
        COMMAND_METRICS => {
            Message::metrics().send(&mut stream)?;
            let response = expect(Message::receive(&mut stream)?, OP_METRICS);
            println!("{}", response.body);
        }
        COMMAND_PING => {
            Message::ping().send(&mut stream)?;
            let response = expect(Message::receive(&mut stream)?, OP_PING);
            if response.body.is_empty() {
                println!("(no other members answered)");
            } else {
                println!("{}", response.body);
            }
        }
        COMMAND_DECLARE => {
            let queue = require_arg(&args, 2, "<queue>");
            Message::declare(queue).send(&mut stream)?;
            let response = expect(Message::receive(&mut stream)?, OP_DECLARE);
            println!("OK DECLARE {} ({})", queue, response.body);
        }
        COMMAND_DELETE => {
            let queue = require_arg(&args, 2, "<queue>");
            Message::delete(queue).send(&mut stream)?;
            let response = Message::receive(&mut stream)?;
            if response.code == OP_EMPTY {
                eprintln!("ERR QUEUE_NOT_FOUND: {}", queue);
                std::process::exit(1);
            }
            expect(response, OP_DELETE);
            println!("OK DELETE {}", queue);
        }
        COMMAND_SEND => {
            let queue = require_arg(&args, 2, "<queue> <body>");
            let body = require_arg(&args, 3, "<body>");
            Message::enqueue(queue, body).send(&mut stream)?;
            let response = expect(Message::receive(&mut stream)?, OP_ENQUEUE_OK);
            println!("OK SEND {} at position {}", queue, response.body);
        }
        COMMAND_RECEIVE => {
            let queue = require_arg(&args, 2, "<queue>");
            Message::dequeue(queue).send(&mut stream)?;
            let response = Message::receive(&mut stream)?;
            if response.code == OP_EMPTY {
                println!("(empty)");
            } else {
                println!("{}", expect(response, OP_DEQUEUE).body);
            }
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}
