/*!
 * cinderkv REPL
 *
 * Line-oriented front end over a private in-process store, for poking at
 * the engine without a network in the way. Values are quoted so they may
 * contain spaces; keys are bare words.
 */

use std::io::{self, BufRead, Write};

use cinderkv::{Store, DEFAULT_MAX_MEMORY};

enum Line {
    Set(String, String),
    Get(String),
    Del(String),
    Exit,
    Invalid,
}

/// Parse one REPL line. Accepted shapes:
/// `SET <key> "<value>"`, `GET <key>`, `DEL <key>`, `EXIT`.
fn parse_line(line: &str) -> Line {
    let line = line.trim();
    if line.eq_ignore_ascii_case("exit") {
        return Line::Exit;
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim_start();

    if verb.eq_ignore_ascii_case("set") {
        // key, then a double-quoted value
        let mut kv = rest.splitn(2, char::is_whitespace);
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("").trim_start();
        if !key.is_empty()
            && value.len() >= 2
            && value.starts_with('"')
            && value.ends_with('"')
        {
            return Line::Set(key.to_string(), value[1..value.len() - 1].to_string());
        }
        return Line::Invalid;
    }

    let single_key = |rest: &str| {
        let key = rest.trim();
        (!key.is_empty() && !key.contains(char::is_whitespace)).then(|| key.to_string())
    };

    if verb.eq_ignore_ascii_case("get") {
        if let Some(key) = single_key(rest) {
            return Line::Get(key);
        }
    } else if verb.eq_ignore_ascii_case("del") {
        if let Some(key) = single_key(rest) {
            return Line::Del(key);
        }
    }
    Line::Invalid
}

fn main() -> io::Result<()> {
    let store = Store::new(DEFAULT_MAX_MEMORY);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("cinderkv> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }

        match parse_line(&line) {
            Line::Set(key, value) => {
                store.set(key.into_bytes(), value.into_bytes());
            }
            Line::Get(key) => match store.get(key.as_bytes()) {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("NULL"),
            },
            Line::Del(key) => {
                if !store.del(key.as_bytes()) {
                    println!("Does not exist.");
                }
            }
            Line::Exit => break,
            Line::Invalid => {
                println!("Invalid command. Supported commands: SET <key> \"<value>\", GET <key>, DEL <key>");
            }
        }
    }

    Ok(())
}
