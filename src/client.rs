//! The line protocol contract: one command per line, a textual response
//! the front-end relays verbatim (terminating it with an empty line).

use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::field::OutputFormat;
use crate::logging;
use crate::util::parse_hex_byte;

/// What the front-end should do after relaying the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep the connection open.
    None,
    /// Close this connection.
    Quit,
    /// Shut the daemon down.
    Stop,
}

/// A command's textual response plus the follow-up action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub action: Action,
}

impl Reply {
    fn text(text: impl Into<String>) -> Reply {
        Reply {
            text: text.into(),
            action: Action::None,
        }
    }
}

fn error_text(error: Error) -> String {
    format!("ERR: {}: {}", error.kind_name(), error)
}

const HELP: &str = "\
read [-m seconds] [-c circuit] name [field]  read a value
write -c circuit name value[;value...]       write values
find [-r|-w|-p] [circuit] [name]             list messages
state                                        engine state
grab [result [all]]                          grabbed telegrams
scan [full|ZZ]                               identification scan
log [level <area> <level>]                   log verbosity
stop                                         shut the daemon down
quit                                         close the connection
help                                         this help";

/// Executes one command line against the dispatcher.
pub fn execute(dispatcher: &Dispatcher, line: &str) -> Reply {
    let mut args = line.split_whitespace();
    let Some(command) = args.next() else {
        return Reply::text(error_text(Error::invalid_arg("command missing")));
    };
    let args: Vec<&str> = args.collect();
    match command.to_lowercase().as_str() {
        "read" | "r" => read(dispatcher, &args),
        "write" | "w" => write(dispatcher, &args),
        "find" | "f" => find(dispatcher, &args),
        "state" => Reply::text(dispatcher.state()),
        "grab" => grab(dispatcher, &args),
        "scan" => scan(dispatcher, &args),
        "log" => log_command(&args),
        "stop" => Reply {
            text: "stopping".to_string(),
            action: Action::Stop,
        },
        "quit" | "q" => Reply {
            text: "connection closed".to_string(),
            action: Action::Quit,
        },
        "help" | "h" | "?" => Reply::text(HELP),
        other => Reply::text(error_text(Error::not_found(format!("command {}", other)))),
    }
}

fn read(dispatcher: &Dispatcher, args: &[&str]) -> Reply {
    let mut max_age = None;
    let mut circuit = None;
    let mut fmt = OutputFormat::default();
    let mut positional: Vec<&str> = Vec::new();
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        match arg {
            "-m" => match iter.next().and_then(|v| v.parse::<u64>().ok()) {
                Some(seconds) => max_age = Some(Duration::from_secs(seconds)),
                None => return Reply::text(error_text(Error::invalid_arg("-m seconds"))),
            },
            "-c" => match iter.next() {
                Some(&name) => circuit = Some(name),
                None => return Reply::text(error_text(Error::invalid_arg("-c circuit"))),
            },
            "-v" => {
                fmt = fmt
                    .with(OutputFormat::NAMES)
                    .with(OutputFormat::UNITS)
                    .with(OutputFormat::COMMENTS)
            }
            "-n" => fmt = fmt.with(OutputFormat::NUMERIC),
            _ => positional.push(arg),
        }
    }
    let (name, field) = match positional.as_slice() {
        [name] => (*name, None),
        [name, field] => (*name, Some(*field)),
        _ => return Reply::text(error_text(Error::invalid_arg("read name [field]"))),
    };
    match dispatcher.read(circuit, name, max_age, fmt, field) {
        Ok(value) => Reply::text(value),
        Err(error) => Reply::text(error_text(error)),
    }
}

fn write(dispatcher: &Dispatcher, args: &[&str]) -> Reply {
    let mut circuit = None;
    let mut positional: Vec<&str> = Vec::new();
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        match arg {
            "-c" => match iter.next() {
                Some(&name) => circuit = Some(name),
                None => return Reply::text(error_text(Error::invalid_arg("-c circuit"))),
            },
            _ => positional.push(arg),
        }
    }
    if positional.is_empty() {
        return Reply::text(error_text(Error::invalid_arg("write name value")));
    }
    let name = positional[0];
    let values = positional[1..].join(" ");
    match dispatcher.write(circuit, name, &values) {
        Ok(result) => Reply::text(result),
        Err(error) => Reply::text(error_text(error)),
    }
}

fn find(dispatcher: &Dispatcher, args: &[&str]) -> Reply {
    let mut direction = None;
    let mut positional: Vec<&str> = Vec::new();
    for &arg in args {
        match arg {
            "-r" => direction = Some(0),
            "-w" => direction = Some(1),
            "-p" => direction = Some(2),
            _ => positional.push(arg),
        }
    }
    let (circuit, name) = match positional.as_slice() {
        [] => ("*", "*"),
        [name] => ("*", *name),
        [circuit, name] => (*circuit, *name),
        _ => return Reply::text(error_text(Error::invalid_arg("find [circuit] [name]"))),
    };
    let messages = dispatcher.find(circuit, name, direction);
    if messages.is_empty() {
        return Reply::text(error_text(Error::not_found(format!("{} {}", circuit, name))));
    }
    let mut lines: Vec<String> = Vec::new();
    for message in messages {
        let value = message
            .decode_last(OutputFormat::default(), None)
            .unwrap_or_else(|_| "no data stored".to_string());
        lines.push(format!("{} {} = {}", message.circuit(), message.name(), value));
    }
    Reply::text(lines.join("\n"))
}

fn grab(dispatcher: &Dispatcher, args: &[&str]) -> Reply {
    match args {
        [] => Reply::text("grab started"),
        ["result"] => Reply::text(dispatcher.grab_dump(true)),
        ["result", "all"] => Reply::text(dispatcher.grab_dump(false)),
        _ => Reply::text(error_text(Error::invalid_arg("grab [result [all]]"))),
    }
}

fn scan(dispatcher: &Dispatcher, args: &[&str]) -> Reply {
    let result = match args {
        [] | ["full"] => dispatcher.scan(None),
        [address] => match parse_hex_byte(address) {
            Ok(address) => dispatcher.scan(Some(address)),
            Err(error) => return Reply::text(error_text(error)),
        },
        _ => return Reply::text(error_text(Error::invalid_arg("scan [full|ZZ]"))),
    };
    match result {
        Ok(text) if text.is_empty() => Reply::text("no participants found"),
        Ok(text) => Reply::text(text),
        Err(error) => Reply::text(error_text(error)),
    }
}

fn log_command(args: &[&str]) -> Reply {
    match args {
        [] => Reply::text(logging::describe()),
        ["level", area, level] => {
            let area = match logging::Area::parse(area) {
                Ok(area) => area,
                Err(error) => return Reply::text(error_text(error)),
            };
            let level = match logging::parse_level(level) {
                Ok(level) => level,
                Err(error) => return Reply::text(error_text(error)),
            };
            logging::set_level(area, level);
            Reply::text("done")
        }
        _ => Reply::text(error_text(Error::invalid_arg("log level <area> <level>"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, Transport};
    use crate::config::Loader;
    use crate::dispatcher::Engine;
    use crate::field::Templates;
    use crate::message::MessageMap;
    use crate::symbol::SYN;

    /// An idle bus: endless SYN, writes swallowed.
    struct IdleTransport;
    impl Transport for IdleTransport {
        fn read_byte(&mut self, _timeout: Duration) -> crate::error::Result<u8> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(SYN)
        }
        fn write_byte(&mut self, _byte: u8) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn engine() -> Engine {
        let mut loader = Loader::new("en");
        let mut map = MessageMap::new();
        let issues = loader.load_messages(
            "u,cir,mode,,,fe,b505,01,,,UCH\nr,cir,date,,,08,b509,0d2900,,,BDA:3\n",
            &Templates::new(),
            &mut map,
        );
        assert!(issues.is_empty(), "{:?}", issues);
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        Engine::start(IdleTransport, config, map)
    }

    #[test]
    fn find_lists_and_marks_missing_data() {
        let engine = engine();
        let reply = execute(&engine.dispatcher, "find cir *");
        assert!(reply.text.contains("cir mode = no data stored"));
        assert!(reply.text.contains("cir date = no data stored"));
        let reply = execute(&engine.dispatcher, "find -p");
        assert!(reply.text.contains("mode"));
        assert!(!reply.text.contains("date"));
        engine.stop();
    }

    #[test]
    fn unknown_command_and_message_errors() {
        let engine = engine();
        let reply = execute(&engine.dispatcher, "explode");
        assert_eq!(reply.text, "ERR: NotFound: not found: command explode");
        let reply = execute(&engine.dispatcher, "read nothing");
        assert!(reply.text.starts_with("ERR: NotFound"));
        engine.stop();
    }

    #[test]
    fn control_commands() {
        let engine = engine();
        assert_eq!(execute(&engine.dispatcher, "quit").action, Action::Quit);
        assert_eq!(execute(&engine.dispatcher, "stop").action, Action::Stop);
        assert!(execute(&engine.dispatcher, "help").text.contains("read"));
        let reply = execute(&engine.dispatcher, "state");
        assert!(reply.text.contains("messages: 2"));
        engine.stop();
    }

    #[test]
    fn log_level_round_trip() {
        let engine = engine();
        let reply = execute(&engine.dispatcher, "log level bus debug");
        assert_eq!(reply.text, "done");
        assert_eq!(logging::level(logging::Area::Bus), log::LevelFilter::Debug);
        let reply = execute(&engine.dispatcher, "log");
        assert!(reply.text.contains("bus: DEBUG"));
        engine.stop();
    }

    #[test]
    fn read_passive_without_data() {
        let engine = engine();
        let reply = execute(&engine.dispatcher, "read -c cir mode");
        assert!(reply.text.starts_with("ERR: NotFound"));
        engine.stop();
    }
}
