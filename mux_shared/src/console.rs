//! Line console used by the binaries.

use std::io::{self, BufRead, Write};

/// Prompts on `out` and hands every non-empty trimmed line of `input` to
/// `on_line`. Returns at end of input or once `on_line` returns false.
pub fn read_lines<R, W, F>(mut input: R, mut out: W, mut on_line: F) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    F: FnMut(String) -> bool,
{
    let mut line = String::new();
    loop {
        write!(out, "] ")?;
        out.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() && !on_line(trimmed.to_string()) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn stops_at_end_of_input() {
        let mut out = Vec::new();
        let mut lines = Vec::new();
        read_lines(Cursor::new("status\n\n   \n quit \n"), &mut out, |l| {
            lines.push(l);
            true
        })
        .unwrap();
        assert_eq!(lines, vec!["status".to_string(), "quit".to_string()]);
        assert_eq!(out, b"] ] ] ] ] ".to_vec());
    }

    #[test]
    fn closed_input_prompts_once() {
        let mut out = Vec::new();
        read_lines(Cursor::new(""), &mut out, |_| panic!("no lines")).unwrap();
        assert_eq!(out, b"] ".to_vec());
    }

    #[test]
    fn stops_when_receiver_is_gone() {
        let mut seen = 0;
        read_lines(Cursor::new("a\nb\nc\n"), io::sink(), |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
    }
}
