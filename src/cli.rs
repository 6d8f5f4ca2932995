//! Line-oriented command shell over a running node.
//!
//! The shell does not own the node's lifecycle; it only issues commands
//! to it. Three commands are understood: `put <text>`, `get <40-hex>`,
//! and `exit`.

use std::io::{self, BufRead, Write};

use crate::Dht;

/// Read commands from `input` until EOF or `exit`, writing results to
/// `output`.
pub fn run<R: BufRead, W: Write>(dht: &Dht, input: R, mut output: W) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if !run_line(dht, &line, &mut output)? {
            break;
        }
    }

    Ok(())
}

/// Execute a single command line; blank lines are ignored and commands
/// are case-insensitive. Returns false when the shell should exit.
///
/// `put` emits the 40 character hex key on its own line; `get` emits the
/// value bytes followed by a `from <address>` line, or `NOTFOUND`.
/// Failures emit a line starting with `ERR`.
pub fn run_line<W: Write>(dht: &Dht, line: &str, output: &mut W) -> io::Result<bool> {
    let (command, argument) = split_command(line);
    if command.is_empty() {
        return Ok(true);
    }

    match command.to_ascii_lowercase().as_str() {
        "put" => {
            if argument.is_empty() {
                writeln!(output, "ERR missing argument")?;
                return Ok(true);
            }

            match dht.put(argument.as_bytes()) {
                Ok(key) => writeln!(output, "{key}")?,
                Err(error) => writeln!(output, "ERR {error}")?,
            }
        }
        "get" => {
            if argument.is_empty() {
                writeln!(output, "ERR missing argument")?;
                return Ok(true);
            }

            match dht.get(argument) {
                Ok(Some((value, from))) => {
                    output.write_all(&value)?;
                    writeln!(output)?;
                    writeln!(output, "from {from}")?;
                }
                Ok(None) => writeln!(output, "NOTFOUND")?,
                Err(error) => writeln!(output, "ERR {error}")?,
            }
        }
        "exit" => return Ok(false),
        _ => writeln!(output, "ERR unknown command")?,
    }

    Ok(true)
}

/// Split a line into its command and the remainder after the first run
/// of whitespace, preserving interior whitespace of the remainder.
fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim();

    match line.find(char::is_whitespace) {
        Some(index) => (&line[..index], line[index..].trim_start()),
        None => (line, ""),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn node() -> Dht {
        Dht::builder()
            .listen("127.0.0.1:0".parse().unwrap())
            .request_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn line(dht: &Dht, input: &str) -> String {
        let mut output = Vec::new();
        run_line(dht, input, &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn split_preserves_interior_whitespace() {
        assert_eq!(split_command("put a  b"), ("put", "a  b"));
        assert_eq!(split_command("  get   abc "), ("get", "abc"));
        assert_eq!(split_command("exit"), ("exit", ""));
        assert_eq!(split_command(""), ("", ""));
    }

    #[test]
    fn put_then_get() {
        let dht = node();

        let key = line(&dht, "put hello world");
        assert_eq!(key.trim(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");

        let output = line(&dht, &format!("get {}", key.trim()));
        assert!(output.starts_with("hello world\n"));
        assert!(output.contains("from "));

        dht.shutdown();
    }

    #[test]
    fn errors_and_misses() {
        let dht = node();

        assert!(line(&dht, "put").starts_with("ERR"));
        assert!(line(&dht, "get").starts_with("ERR"));
        assert!(line(&dht, "get abc").starts_with("ERR"));
        assert!(line(&dht, "frobnicate").starts_with("ERR"));
        assert_eq!(
            line(&dht, "get 00112233445566778899aabbccddeeff00112233").trim(),
            "NOTFOUND"
        );

        dht.shutdown();
    }

    #[test]
    fn run_stops_at_exit() {
        let dht = node();
        let mut output = Vec::new();

        let input = Cursor::new("\nput first\nexit\nput second\n");
        run(&dht, input, &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        // One key line only; nothing after exit ran.
        assert_eq!(text.lines().count(), 1);

        dht.shutdown();
    }
}
