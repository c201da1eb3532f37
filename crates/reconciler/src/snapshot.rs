//! Streamed Snapshot Reader (§4.D): a lazy, single-pass reader over a
//! recursive `{"node": {...}}`-shaped dump, yielding `(key, value)` leaves as
//! soon as a nested object has accumulated both fields, without
//! materializing the whole document. Snapshots can carry hundreds of
//! thousands of entries, so this is a pull-based iterator coupled to a
//! hand-rolled tokenizer rather than a fully-parsed `serde_json::Value` tree
//! (which would require buffering the entire document).

use std::io::{
    self,
    BufReader,
    Bytes,
    Read,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub key: String,
    pub value: String,
}

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot transport failed: {0}")]
    Transport(#[from] io::Error),
    #[error("malformed snapshot stream: {0}")]
    Malformed(String),
}

/// A single accumulating object scope: the fields relevant to leaf detection,
/// plus the key name a following string/scalar value will be assigned to.
#[derive(Default)]
struct Frame {
    current_key: Option<String>,
    key: Option<String>,
    value: Option<String>,
    /// Leaves are emitted once per completed frame, even if further string
    /// fields are encountered in the same object afterwards.
    emitted: bool,
}

impl Frame {
    fn assign(&mut self, value: String) {
        match self.current_key.take().as_deref() {
            Some("key") => self.key = Some(value),
            Some("value") => self.value = Some(value),
            _ => {},
        }
    }

    fn take_leaf_if_complete(&mut self) -> Option<Leaf> {
        if self.emitted {
            return None;
        }
        if let (Some(key), Some(value)) = (&self.key, &self.value) {
            self.emitted = true;
            Some(Leaf {
                key: key.clone(),
                value: value.clone(),
            })
        } else {
            None
        }
    }
}

enum Container {
    Object(Frame),
    Array,
}

/// Low-level tokens produced by the byte-level scanner. `Other` covers
/// numbers, `true`, `false` and `null` — scalars this format never needs the
/// value of, so they're scanned past rather than decoded.
#[derive(Debug, PartialEq, Eq)]
enum Token {
    ObjectStart,
    ObjectEnd,
    ArrayStart,
    ArrayEnd,
    Colon,
    Comma,
    Str(String),
    Other,
    Eof,
}

struct Tokenizer<R: Read> {
    bytes: Bytes<BufReader<R>>,
    peeked: Option<u8>,
}

impl<R: Read> Tokenizer<R> {
    fn new(reader: R) -> Self {
        Self {
            bytes: BufReader::new(reader).bytes(),
            peeked: None,
        }
    }

    fn next_byte(&mut self) -> Result<Option<u8>, SnapshotError> {
        if let Some(b) = self.peeked.take() {
            return Ok(Some(b));
        }
        match self.bytes.next() {
            Some(Ok(b)) => Ok(Some(b)),
            Some(Err(e)) => Err(SnapshotError::Transport(e)),
            None => Ok(None),
        }
    }

    fn peek_byte(&mut self) -> Result<Option<u8>, SnapshotError> {
        if self.peeked.is_none() {
            self.peeked = self.next_byte()?;
        }
        Ok(self.peeked)
    }

    fn skip_whitespace(&mut self) -> Result<(), SnapshotError> {
        while let Some(b) = self.peek_byte()? {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.peeked = None;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn read_string(&mut self) -> Result<String, SnapshotError> {
        let mut out = String::new();
        loop {
            let b = self
                .next_byte()?
                .ok_or_else(|| SnapshotError::Malformed("unterminated string".into()))?;
            match b {
                b'"' => return Ok(out),
                b'\\' => {
                    let esc = self
                        .next_byte()?
                        .ok_or_else(|| SnapshotError::Malformed("unterminated escape".into()))?;
                    match esc {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'b' => out.push('\u{8}'),
                        b'f' => out.push('\u{c}'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'u' => {
                            let mut hex = [0u8; 4];
                            for slot in &mut hex {
                                *slot = self.next_byte()?.ok_or_else(|| {
                                    SnapshotError::Malformed("unterminated \\u escape".into())
                                })?;
                            }
                            let code = u32::from_str_radix(std::str::from_utf8(&hex).map_err(
                                |_| SnapshotError::Malformed("invalid \\u escape".into()),
                            )?, 16)
                            .map_err(|_| SnapshotError::Malformed("invalid \\u escape".into()))?;
                            out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                        },
                        other => {
                            return Err(SnapshotError::Malformed(format!(
                                "invalid escape \\{}",
                                other as char
                            )))
                        },
                    }
                },
                _ => {
                    // Accumulate raw bytes; the stream is UTF-8, we just
                    // don't validate multi-byte sequences byte-by-byte.
                    out.push(b as char);
                },
            }
        }
    }

    fn skip_scalar(&mut self) -> Result<(), SnapshotError> {
        while let Some(b) = self.peek_byte()? {
            if matches!(b, b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r') {
                break;
            }
            self.peeked = None;
        }
        Ok(())
    }

    fn next_token(&mut self) -> Result<Token, SnapshotError> {
        self.skip_whitespace()?;
        let Some(b) = self.peek_byte()? else {
            return Ok(Token::Eof);
        };
        match b {
            b'{' => {
                self.peeked = None;
                Ok(Token::ObjectStart)
            },
            b'}' => {
                self.peeked = None;
                Ok(Token::ObjectEnd)
            },
            b'[' => {
                self.peeked = None;
                Ok(Token::ArrayStart)
            },
            b']' => {
                self.peeked = None;
                Ok(Token::ArrayEnd)
            },
            b':' => {
                self.peeked = None;
                Ok(Token::Colon)
            },
            b',' => {
                self.peeked = None;
                Ok(Token::Comma)
            },
            b'"' => {
                self.peeked = None;
                Ok(Token::Str(self.read_string()?))
            },
            _ => {
                self.skip_scalar()?;
                Ok(Token::Other)
            },
        }
    }
}

/// Pull-based, single-pass reader over a recursive key/value dump. Not
/// restartable: once exhausted (or once an error is returned), construct a
/// new reader over a fresh snapshot request.
pub struct SnapshotReader<R: Read> {
    tokenizer: Tokenizer<R>,
    containers: Vec<Container>,
    current: Frame,
    /// Whether the next string token encountered should be treated as an
    /// object key (as opposed to a value) — true right after `{` or `,`
    /// inside an object, before the following `:`.
    expect_key: bool,
    done: bool,
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            tokenizer: Tokenizer::new(reader),
            containers: Vec::new(),
            current: Frame::default(),
            expect_key: false,
            done: false,
        }
    }

    fn handle_value_string(&mut self, s: String) -> Option<Leaf> {
        if self.expect_key && matches!(self.containers.last(), Some(Container::Object(_))) {
            self.current.current_key = Some(s);
            self.expect_key = false;
            None
        } else {
            self.current.assign(s);
            self.current.take_leaf_if_complete()
        }
    }

    fn step(&mut self) -> Result<Option<Leaf>, SnapshotError> {
        loop {
            let token = self.tokenizer.next_token()?;
            match token {
                Token::Eof => {
                    self.done = true;
                    return Ok(None);
                },
                Token::ObjectStart => {
                    self.containers
                        .push(Container::Object(std::mem::take(&mut self.current)));
                    self.expect_key = true;
                },
                Token::ObjectEnd => {
                    match self.containers.pop() {
                        Some(Container::Object(outer)) => self.current = outer,
                        Some(Container::Array) => {
                            return Err(SnapshotError::Malformed(
                                "unbalanced object close inside array".into(),
                            ))
                        },
                        None => {
                            return Err(SnapshotError::Malformed(
                                "unbalanced object close".into(),
                            ))
                        },
                    }
                    self.expect_key = false;
                },
                Token::ArrayStart => {
                    self.containers.push(Container::Array);
                    self.expect_key = false;
                },
                Token::ArrayEnd => {
                    match self.containers.pop() {
                        Some(Container::Array) => {},
                        _ => return Err(SnapshotError::Malformed("unbalanced array close".into())),
                    }
                },
                Token::Colon => {
                    // The key was already captured when its string token
                    // arrived; the following value's string (if any) isn't a
                    // key, regardless of container.
                    self.expect_key = false;
                },
                Token::Comma => {
                    if matches!(self.containers.last(), Some(Container::Object(_))) {
                        self.expect_key = true;
                    }
                },
                Token::Str(s) => {
                    if let Some(leaf) = self.handle_value_string(s) {
                        return Ok(Some(leaf));
                    }
                },
                Token::Other => {},
            }
        }
    }
}

impl<R: Read> Iterator for SnapshotReader<R> {
    type Item = Result<Leaf, SnapshotError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(leaf)) => Some(Ok(leaf)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}
