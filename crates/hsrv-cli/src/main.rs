//! hsrv CLI Client
//!
//! Command-line client for hsrv servers.
//!
//! # Usage
//!
//! ```bash
//! # Interactive session with a local server
//! hsrv
//!
//! # Print which digests from a file the server knows
//! md5sum * | hsrv --lookup
//!
//! # Print the ones it doesn't
//! hsrv --lookup --unknown < digests.txt
//!
//! # Execute single command
//! hsrv -c "QUERY D41D8CD98F00B204E9800998ECF8427E"
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use hsrv_core::digest::is_well_formed;
use hsrv_core::DIGEST_LEN;
use hsrv_protocol::parser::MAX_PENDING_BYTES;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const GREETING: &str = "VERSION: 2.0";

/// Most digests whose QUERY line still fits the server's line limit
const MAX_BATCH: usize = (MAX_PENDING_BYTES - "QUERY\r\n".len()) / (DIGEST_LEN + 1);

/// hsrv Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "hsrv")]
#[command(author, version, about = "hsrv CLI - MD5 hash-set lookup client")]
struct Args {
    /// Server hostname
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "HSRV_HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "9120", env = "HSRV_PORT")]
    port: u16,

    /// Execute command and exit
    #[arg(short, long, conflicts_with = "lookup")]
    command: Option<String>,

    /// Read digests from stdin and print the ones the server knows
    #[arg(short, long)]
    lookup: bool,

    /// With --lookup, print the digests the server doesn't know instead
    #[arg(short, long, requires = "lookup")]
    unknown: bool,

    /// Digests sent per QUERY (at most 1985)
    #[arg(long, default_value = "1024", value_parser = clap::value_parser!(u16).range(1..=MAX_BATCH as i64))]
    batch: u16,

    /// Seconds to wait for a reply
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    quiet: bool,
}

/// One protocol-2 session with the server
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_read_timeout(Some(timeout))?;

        let mut conn = Connection {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };

        let reply = conn.request(GREETING)?;
        if reply != "OK" {
            bail!("Server refused {:?}: {}", GREETING, reply);
        }
        Ok(conn)
    }

    /// Send one line and wait for the reply line
    fn request(&mut self, line: &str) -> Result<String> {
        self.send(line)?;
        let mut response = String::new();
        if self.reader.read_line(&mut response)? == 0 {
            bail!("Connection closed by server");
        }
        Ok(response.trim_end().to_string())
    }

    fn send(&mut self, line: &str) -> Result<()> {
        write!(self.writer, "{}\r\n", line)?;
        self.writer.flush()?;
        Ok(())
    }

    fn bye(mut self) {
        let _ = self.send("BYE");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let addr = format!("{}:{}", args.host, args.port);
    let timeout = Duration::from_secs(args.timeout);
    let mut conn = Connection::open(&addr, timeout)?;

    if args.lookup {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let summary = lookup(
            &mut conn,
            stdin.lock(),
            &mut stdout.lock(),
            args.batch as usize,
            !args.unknown,
        )?;
        conn.bye();
        if summary.skipped > 0 {
            eprintln!(
                "{} {} malformed line(s) skipped",
                "Warning:".yellow(),
                summary.skipped
            );
        }
        return Ok(());
    }

    // Single command mode
    if let Some(cmd) = args.command {
        if let Some(reply) = run_command(conn, &cmd)? {
            print_reply(&reply);
        }
        return Ok(());
    }

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  ╦ ╦╔═╗╦═╗╦  ╦  CLI
  ╠═╣╚═╗╠╦╝╚╗╔╝  Connected to {}
  ╩ ╩╚═╝╩╚═ ╚╝   Type 'help' for commands, 'quit' to exit
"#,
                addr
            )
            .cyan()
        );
    }

    // Interactive mode
    let mut rl = DefaultEditor::new()?;
    let history_path = history_file();
    if let Some(ref path) = history_path {
        let _ = rl.load_history(path);
    }

    loop {
        let prompt = format!("{}> ", "hsrv".green());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                // Handle local commands
                match line.to_uppercase().as_str() {
                    "QUIT" | "EXIT" => break,
                    "HELP" => {
                        print_help();
                        continue;
                    }
                    "CLEAR" => {
                        print!("\x1B[2J\x1B[1;1H");
                        continue;
                    }
                    _ => {}
                }

                if line.eq_ignore_ascii_case("BYE") {
                    break;
                }

                match conn.request(line) {
                    Ok(reply) => {
                        print_reply(&reply);
                        // The server hangs up after a refusal
                        if reply == "NOT OK" {
                            conn = reconnect(&addr, timeout)?;
                        }
                    }
                    Err(e) => {
                        eprintln!("{} {}", "Error:".red(), e);
                        conn = reconnect(&addr, timeout)?;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    conn.bye();
    if let Some(ref path) = history_path {
        let _ = rl.save_history(path);
    }
    Ok(())
}

/// Send one command and close. BYE is answered by the server hanging up,
/// so it is sent without waiting.
fn run_command(mut conn: Connection, cmd: &str) -> Result<Option<String>> {
    let cmd = cmd.trim();
    if cmd.eq_ignore_ascii_case("BYE") {
        conn.send(cmd)?;
        return Ok(None);
    }

    let reply = conn.request(cmd)?;
    conn.bye();
    Ok(Some(reply))
}

/// REPL history location: `$HSRV_HISTORY`, else `~/.hsrv_history`
fn history_file() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("HSRV_HISTORY") {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".hsrv_history"))
}

fn reconnect(addr: &str, timeout: Duration) -> Result<Connection> {
    match Connection::open(addr, timeout) {
        Ok(conn) => {
            println!("{}", "Reconnected.".yellow());
            Ok(conn)
        }
        Err(e) => {
            eprintln!("{}", "Connection lost.".red());
            Err(e)
        }
    }
}

/// Counts from a bulk lookup
#[derive(Debug, Default, PartialEq)]
struct LookupSummary {
    queried: usize,
    printed: usize,
    skipped: usize,
}

/// Stream digests from `input` to the server in batches and print the ones
/// whose membership equals `want`.
fn lookup<R: BufRead, W: Write>(
    conn: &mut Connection,
    input: R,
    out: &mut W,
    batch_size: usize,
    want: bool,
) -> Result<LookupSummary> {
    let mut summary = LookupSummary::default();
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);

    for (n, line) in input.lines().enumerate() {
        let line = line?;
        let Some(digest) = line.split_whitespace().next() else {
            continue;
        };
        if !is_well_formed(digest) {
            eprintln!("{} line {}: not an MD5 digest: {}", "Skipped".yellow(), n + 1, digest);
            summary.skipped += 1;
            continue;
        }

        batch.push(digest.to_uppercase());
        if batch.len() == batch_size {
            run_batch(conn, &batch, out, want, &mut summary)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        run_batch(conn, &batch, out, want, &mut summary)?;
    }

    out.flush()?;
    Ok(summary)
}

fn run_batch<W: Write>(
    conn: &mut Connection,
    batch: &[String],
    out: &mut W,
    want: bool,
    summary: &mut LookupSummary,
) -> Result<()> {
    let reply = conn.request(&query_line(batch))?;
    let hits = parse_hits(&reply, batch.len())?;

    for (digest, hit) in batch.iter().zip(hits) {
        if hit == want {
            writeln!(out, "{}", digest)?;
            summary.printed += 1;
        }
    }
    summary.queried += batch.len();
    Ok(())
}

fn query_line(digests: &[String]) -> String {
    let mut line = String::with_capacity(6 + digests.len() * 33);
    line.push_str("QUERY");
    for digest in digests {
        line.push(' ');
        line.push_str(digest);
    }
    line
}

/// Decode an `OK <bits>` reply for `expected` digests
fn parse_hits(reply: &str, expected: usize) -> Result<Vec<bool>> {
    let bits = match reply.strip_prefix("OK") {
        Some(rest) => rest.trim(),
        None => bail!("Query refused: {}", reply),
    };
    if bits.len() != expected {
        bail!("Expected {} results, got {:?}", expected, bits);
    }
    bits.chars()
        .map(|c| match c {
            '1' => Ok(true),
            '0' => Ok(false),
            other => bail!("Unexpected character {:?} in reply", other),
        })
        .collect()
}

fn print_reply(reply: &str) {
    if reply == "NOT OK" {
        println!("{}", reply.red());
    } else if reply == "NOT SUPPORTED" {
        println!("{}", reply.yellow());
    } else if reply.starts_with("OK") {
        println!("{}", reply.green());
    } else {
        println!("{}", reply);
    }
}

fn print_help() {
    println!(
        r#"
{}

{}
  QUERY <md5> [<md5> ...]                One 1/0 per digest: known/unknown
  STATUS                                 Hash count and server load
  DOWNSHIFT                              Switch to protocol 1 (one query, then close)
  UPSHIFT                                Stay on protocol 2
  BYE                                    Close connection

{}
  help                                   Show this help
  clear                                  Clear screen
  quit/exit                              Exit CLI
"#,
        "hsrv Commands".cyan().bold(),
        "Server".yellow().bold(),
        "Local".yellow().bold(),
    );
}
