//! Incremental scanner for a bulk JSON array of objects.
//!
//! Delimits complete top-level objects from raw byte chunks without a full
//! parse: a brace-depth counter plus an in-string flag with escape handling.
//! Each delimited object is handed back as its own byte slice for a normal
//! `serde_json` parse, so a malformed element costs one record, not the run.

use memchr::memchr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Between array elements, waiting for the next `{` (or the closing `]`).
    Searching,
    /// Inside an object, outside any string literal.
    Default,
    /// Inside a string literal; `escaped` means the previous byte was an
    /// unconsumed backslash.
    InString { escaped: bool },
}

pub struct ObjectScanner {
    buf: Vec<u8>,
    pos: usize,
    depth: u32,
    obj_start: usize,
    state: ScanState,
    array_started: bool,
    array_done: bool,
}

impl Default for ObjectScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectScanner {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            depth: 0,
            obj_start: 0,
            state: ScanState::Searching,
            array_started: false,
            array_done: false,
        }
    }

    /// True once the closing `]` of the top-level array was seen.
    pub fn is_complete(&self) -> bool {
        self.array_done
    }

    /// Feed one chunk; returns every complete object it delimits.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if self.array_done {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        if !self.array_started {
            match memchr(b'[', &self.buf) {
                Some(i) => {
                    self.buf.drain(..=i);
                    self.array_started = true;
                    self.pos = 0;
                }
                None => {
                    // everything before the opening bracket is noise
                    self.buf.clear();
                    return out;
                }
            }
        }

        while self.pos < self.buf.len() {
            let c = self.buf[self.pos];
            match self.state {
                ScanState::Searching => match c {
                    b'{' => {
                        self.state = ScanState::Default;
                        self.depth = 1;
                        self.obj_start = self.pos;
                    }
                    b']' => {
                        self.array_done = true;
                        self.buf.clear();
                        self.pos = 0;
                        return out;
                    }
                    // whitespace and commas between elements
                    _ => {}
                },
                ScanState::Default => match c {
                    b'"' => self.state = ScanState::InString { escaped: false },
                    b'{' => self.depth += 1,
                    b'}' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            out.push(self.buf[self.obj_start..=self.pos].to_vec());
                            self.buf.drain(..=self.pos);
                            self.pos = 0;
                            self.obj_start = 0;
                            self.state = ScanState::Searching;
                            // pos already points at the byte after the object
                            continue;
                        }
                    }
                    _ => {}
                },
                ScanState::InString { escaped } => {
                    if escaped {
                        // the escaped character is consumed without interpretation
                        self.state = ScanState::InString { escaped: false };
                    } else if c == b'\\' {
                        self.state = ScanState::InString { escaped: true };
                    } else if c == b'"' {
                        self.state = ScanState::Default;
                    }
                }
            }
            self.pos += 1;
        }

        // Keep only the open object's bytes (if any) across chunk boundaries.
        if self.state == ScanState::Searching {
            self.buf.clear();
            self.pos = 0;
        } else if self.obj_start > 0 {
            self.buf.drain(..self.obj_start);
            self.pos -= self.obj_start;
            self.obj_start = 0;
        }
        out
    }

    /// Call after the last chunk; errors when the input ended mid-array.
    pub fn finish(self) -> anyhow::Result<()> {
        if !self.array_started {
            anyhow::bail!("input ended before the opening '[' of the feed array");
        }
        if !self.array_done {
            anyhow::bail!(
                "input ended before the feed array was closed ({} bytes pending)",
                self.buf.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&str]) -> (Vec<String>, ObjectScanner) {
        let mut scanner = ObjectScanner::new();
        let mut objects = Vec::new();
        for chunk in chunks {
            for obj in scanner.feed(chunk.as_bytes()) {
                objects.push(String::from_utf8(obj).unwrap());
            }
        }
        (objects, scanner)
    }

    #[test]
    fn whole_array_in_one_chunk() {
        let (objs, scanner) = collect(&[r#"[{"a":1},{"b":2}]"#]);
        assert_eq!(objs, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        assert!(scanner.is_complete());
        assert!(scanner.finish().is_ok());
    }

    #[test]
    fn split_mid_object() {
        let (objs, _) = collect(&[r#"[{"a":"#, r#"1},{"b":"#, r#"2}]"#]);
        assert_eq!(objs, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn split_mid_string_and_mid_escape() {
        // the brace and quote inside the string must not confuse the scanner,
        // even when the chunk boundary lands right after the backslash
        let (objs, _) = collect(&[r#"[{"name":"a } \"#, r#"" b","x":1}]"#]);
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0], r#"{"name":"a } \" b","x":1}"#);
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let (objs, _) = collect(&[r#"[{"t":"{{{"},{"u":"}}}"}]"#]);
        assert_eq!(objs, vec![r#"{"t":"{{{"}"#, r#"{"u":"}}}"}"#]);
    }

    #[test]
    fn nested_objects_count_depth() {
        let (objs, _) = collect(&[r#"[{"prices":{"usd":"1.00","deep":{"x":2}}}]"#]);
        assert_eq!(objs, vec![r#"{"prices":{"usd":"1.00","deep":{"x":2}}}"#]);
    }

    #[test]
    fn noise_before_opening_bracket_is_discarded() {
        let (objs, _) = collect(&["garbage ", "more noise [", r#"{"a":1}]"#]);
        assert_eq!(objs, vec![r#"{"a":1}"#]);
    }

    #[test]
    fn array_termination_stops_consumption() {
        let mut scanner = ObjectScanner::new();
        let objs = scanner.feed(br#"[{"a":1}] {"trailing":"junk"}"#);
        assert_eq!(objs.len(), 1);
        assert!(scanner.is_complete());
        assert!(scanner.feed(br#"{"more":1}"#).is_empty());
    }

    #[test]
    fn empty_array_completes() {
        let mut scanner = ObjectScanner::new();
        assert!(scanner.feed(b"[ ]").is_empty());
        assert!(scanner.is_complete());
    }

    #[test]
    fn truncated_input_fails_finish() {
        let (objs, scanner) = collect(&[r#"[{"a":1},{"b":"#]);
        assert_eq!(objs.len(), 1);
        assert!(scanner.finish().is_err());
    }

    #[test]
    fn one_byte_chunks() {
        let input = r#"[{"a":"x,y"},{"b":{"c":"]"}}]"#;
        let mut scanner = ObjectScanner::new();
        let mut objs = Vec::new();
        for b in input.as_bytes() {
            for obj in scanner.feed(std::slice::from_ref(b)) {
                objs.push(String::from_utf8(obj).unwrap());
            }
        }
        assert_eq!(objs, vec![r#"{"a":"x,y"}"#, r#"{"b":{"c":"]"}}"#]);
        assert!(scanner.is_complete());
    }
}
