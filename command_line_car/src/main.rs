//! # Command Line Car
//!
//! Interactive console for the car. Keeps a connection to the control endpoint open and sends a
//! control message for every drive or camera command typed in. The streaming and telemetry
//! endpoints can be attached to briefly to check what the car is sending.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::net::TcpStream;
use color_eyre::{Result, eyre::{WrapErr, eyre}};
use comms_if::{
    net::{Endpoint, tungstenite::{self, Message, WebSocket, stream::MaybeTlsStream}},
    tc::CarCmd,
    tm::TelemetryRecord
};
use rustyline::{DefaultEditor, error::ReadlineError};
use structopt::StructOpt;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

const PROMPT: &str = "Car $ ";
const HISTORY_PATH: &str = "data/car_history.txt";

const HELP: &str = "\
Commands:
    adv <pct>             drive forwards
    ret <pct>             drive backwards
    brake                 stop the wheels
    left <pct>            spin left
    right <pct>           spin right
    look <pan|tilt> <deg> point the camera, -90 to 90 degrees
    raw <text>            send text to the control endpoint as is
    tm <n>                print n telemetry records
    stream <n>            print the size of n frames
    help                  show this message
    quit                  exit the console";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "command_line_car", about = "Operator console for the robot car")]
struct Args {
    /// WebSocket address of the car
    #[structopt(short, long, default_value = "ws://127.0.0.1:8080")]
    addr: String
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum ConsoleCmd {
    Car(CarCmd),
    Raw(String),
    Watch(Endpoint, usize),
    Help,
    Quit
}

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::from_args();
    let addr = args.addr.trim_end_matches('/');

    let mut control = connect(addr, Endpoint::Control)?;
    println!("Connected to {}", addr);

    let mut rl = DefaultEditor::new()
        .wrap_err("Could not start the line editor")?;
    if rl.load_history(HISTORY_PATH).is_err() {
        println!("No history detected");
    }

    loop {
        let line = match rl.readline(PROMPT) {
            Ok(l) => l,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                println!("Unhandled Error: {:?}", e);
                break
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue
        }
        let _ = rl.add_history_entry(line);

        let result = match parse(line) {
            Ok(ConsoleCmd::Quit) => break,
            Ok(ConsoleCmd::Help) => {
                println!("{}", HELP);
                Ok(())
            },
            Ok(ConsoleCmd::Car(cmd)) => send_cmd(&mut control, &cmd),
            Ok(ConsoleCmd::Raw(text)) => control.send(Message::Text(text))
                .wrap_err("Could not send to the control endpoint"),
            Ok(ConsoleCmd::Watch(endpoint, count)) => watch(addr, endpoint, count),
            Err(e) => {
                println!("{}", e);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("Error: {:?}", e);
        }
    }

    // Best effort, the car drops the connection anyway when the socket closes
    control.close(None).ok();
    control.flush().ok();

    if let Err(e) = rl.save_history(HISTORY_PATH) {
        println!("Could not save the history: {}", e);
    }

    println!("Exiting...");

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn parse(line: &str) -> Result<ConsoleCmd, String> {
    let mut words = line.split_whitespace();

    match words.next() {
        Some("quit") | Some("exit") => Ok(ConsoleCmd::Quit),
        Some("help") => Ok(ConsoleCmd::Help),
        Some("raw") => Ok(ConsoleCmd::Raw(line["raw".len()..].trim().to_owned())),
        Some("tm") => parse_count(words.next()).map(|n| ConsoleCmd::Watch(Endpoint::Telemetry, n)),
        Some("stream") => parse_count(words.next()).map(|n| ConsoleCmd::Watch(Endpoint::Stream, n)),
        _ => CarCmd::from_iter_safe(std::iter::once("car").chain(line.split_whitespace()))
            .map(ConsoleCmd::Car)
            .map_err(|e| e.to_string())
    }
}

fn parse_count(word: Option<&str>) -> Result<usize, String> {
    match word {
        Some(w) => w.parse().map_err(|_| format!("Expected a number of messages, got \"{}\"", w)),
        None => Ok(1)
    }
}

fn connect(addr: &str, endpoint: Endpoint) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
    let url = format!("{}{}", addr, endpoint.path());

    match tungstenite::connect(url.as_str()) {
        Ok((ws, _)) => Ok(ws),
        Err(tungstenite::Error::Http(resp)) => {
            let body = resp.body().as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            Err(eyre!("The car refused {}: {} {}", url, resp.status(), body))
        },
        Err(e) => Err(e).wrap_err_with(|| format!("Could not connect to {}", url))
    }
}

fn send_cmd(control: &mut WebSocket<MaybeTlsStream<TcpStream>>, cmd: &CarCmd) -> Result<()> {
    cmd.validate().wrap_err("Invalid command")?;

    let json = cmd.to_json().wrap_err("Could not serialise the command")?;
    control.send(Message::Text(json))
        .wrap_err("Could not send to the control endpoint")
}

/// Attach to a session endpoint, print `count` messages and close.
fn watch(addr: &str, endpoint: Endpoint, count: usize) -> Result<()> {
    let mut ws = connect(addr, endpoint)?;
    let mut received = 0;

    while received < count {
        match ws.read().wrap_err("Connection to the car lost")? {
            Message::Text(text) => {
                received += 1;
                match TelemetryRecord::from_json(&text) {
                    Ok(rec) => println!("[{}] {:?}", received, rec),
                    Err(_) => println!("[{}] {}", received, text)
                }
            },
            Message::Binary(data) => {
                received += 1;
                println!("[{}] frame of {} bytes", received, data.len());
            },
            Message::Close(frame) => {
                println!("The car closed the connection: {:?}", frame);
                return Ok(())
            },
            _ => ()
        }
    }

    ws.close(None).wrap_err("Could not close the connection")?;

    // The car answers the close once the session has let go of the connection
    loop {
        match ws.read() {
            Ok(_) => (),
            Err(tungstenite::Error::ConnectionClosed) => break,
            Err(e) => return Err(e).wrap_err("Connection lost while closing")
        }
    }

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::tc::ServoAxis;

    #[test]
    fn test_parse() {
        assert_eq!(parse("quit"), Ok(ConsoleCmd::Quit));
        assert_eq!(parse("adv 40"), Ok(ConsoleCmd::Car(CarCmd::Advance { duty_pct: 40 })));
        assert_eq!(
            parse("look tilt -20"),
            Ok(ConsoleCmd::Car(CarCmd::PanTilt { axis: ServoAxis::Tilt, angle_deg: -20 }))
        );
        assert_eq!(parse("raw {\"command\": 9}"), Ok(ConsoleCmd::Raw("{\"command\": 9}".into())));
        assert_eq!(parse("tm 3"), Ok(ConsoleCmd::Watch(Endpoint::Telemetry, 3)));
        assert_eq!(parse("stream"), Ok(ConsoleCmd::Watch(Endpoint::Stream, 1)));
        assert!(parse("stream lots").is_err());
        assert!(parse("fly 10").is_err());
    }
}
