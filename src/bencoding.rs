use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use crate::util::force_string;

/// Containers nested deeper than this are rejected.
const MAX_DEPTH: usize = 64;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ErrorElem {
    Unknown,
    Str,
    Int,
    List,
    Dict,
}

impl fmt::Display for ErrorElem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorElem::Unknown => "value",
            ErrorElem::Str => "byte string",
            ErrorElem::Int => "integer",
            ErrorElem::List => "list",
            ErrorElem::Dict => "dictionary",
        };
        write!(f, "{name}")
    }
}

/// Failure to decode a bencoded value.
///
/// `elem` is the kind of value that was being decoded and `index` the position in the source
/// where decoding went wrong. Failures inside containers keep the inner failure as `source`,
/// so the full chain can be walked with [`std::error::Error::source`].
#[derive(PartialEq, Debug)]
pub struct DecodeError {
    pub elem: ErrorElem,
    pub index: usize,
    msg: String,
    cause: Option<Box<DecodeError>>,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "failed to decode {} at index {}: {}",
            self.elem, self.index, self.msg
        )
    }
}

// written by hand so that the cause downcasts to `DecodeError` rather than to its box
impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

impl DecodeError {
    fn new(elem: ErrorElem, index: usize, msg: impl Into<String>) -> Self {
        DecodeError {
            elem,
            index,
            msg: msg.into(),
            cause: None,
        }
    }

    fn wrap(elem: ErrorElem, index: usize, msg: impl Into<String>, cause: DecodeError) -> Self {
        DecodeError {
            elem,
            index,
            msg: msg.into(),
            cause: Some(Box::new(cause)),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Value {
    Str(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>), // keys are kept sorted, encoding is canonical
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "\"{}\"", force_string(s)),
            Value::Int(i) => write!(f, "{i}"),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Dict(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {v}", force_string(k))?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Value {
    #[cfg(test)]
    pub fn str(s: &str) -> Self {
        Value::Str(s.as_bytes().to_vec())
    }

    #[cfg(test)]
    pub fn dict<const N: usize>(entries: [(&str, Value); N]) -> Self {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Str(s) => encode_string(s, buf),
            Value::Int(i) => buf.extend_from_slice(format!("i{i}e").as_bytes()),
            Value::List(l) => {
                buf.push(b'l');
                l.iter().for_each(|v| v.encode_into(buf));
                buf.push(b'e');
            }
            Value::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    encode_string(k, buf);
                    v.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Decodes one value from the start of `source`, ignoring whatever follows it.
    pub fn new(source: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(source).map(|(v, _)| v)
    }

    /// Decodes one value from the start of `source`.
    ///
    /// Returns the value and the index of the last byte that belongs to it, i.e. the encoded
    /// length minus one.
    pub fn decode(source: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (v, next) = Self::decode_at(source, 0, 0)?;
        Ok((v, next - 1))
    }

    // returns the value and the index of the next byte to read, `depth` is the number of
    // enclosing containers
    fn decode_at(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), DecodeError> {
        match source.get(index) {
            Some(b'0'..=b'9') => Self::parse_str(source, index),
            Some(b'i') => Self::parse_int(source, index),
            Some(b'l') => Self::parse_list(source, index, depth),
            Some(b'd') => Self::parse_dict(source, index, depth),
            Some(c) => Err(DecodeError::new(
                ErrorElem::Unknown,
                index,
                format!("unrecognized token '{}'", c.escape_ascii()),
            )),
            None => Err(DecodeError::new(
                ErrorElem::Unknown,
                index,
                "unexpected end of input",
            )),
        }
    }

    fn parse_str(source: &[u8], start: usize) -> Result<(Self, usize), DecodeError> {
        let mut index = start;
        loop {
            match source.get(index) {
                Some(b'0'..=b'9') => index += 1,
                Some(b':') => break,
                Some(_) => {
                    return Err(DecodeError::new(
                        ErrorElem::Str,
                        index,
                        "failed to decode string length: expected a digit or ':'",
                    ))
                }
                None => {
                    return Err(DecodeError::new(
                        ErrorElem::Str,
                        start,
                        "expected string separator ':', but did not find it",
                    ))
                }
            }
        }
        let len = std::str::from_utf8(&source[start..index])
            .ok()
            .and_then(|l| l.parse::<usize>().ok())
            .ok_or_else(|| {
                DecodeError::new(ErrorElem::Str, start, "failed to decode string length")
            })?;
        let begin = index + 1;
        let end = begin
            .checked_add(len)
            .filter(|end| *end <= source.len())
            .ok_or_else(|| {
                DecodeError::new(
                    ErrorElem::Str,
                    start,
                    format!("string of length {len} exceeds the input"),
                )
            })?;
        Ok((Value::Str(source[begin..end].to_vec()), end))
    }

    fn parse_int(source: &[u8], start: usize) -> Result<(Self, usize), DecodeError> {
        let body_start = start + 1;
        let body_end = match source[body_start.min(source.len())..]
            .iter()
            .position(|c| *c == b'e')
        {
            Some(p) => body_start + p,
            None => {
                return Err(DecodeError::new(
                    ErrorElem::Int,
                    start,
                    "failed to parse integer, 'e' not found",
                ))
            }
        };
        let body = &source[body_start..body_end];
        let magnitude = body.strip_prefix(b"-").unwrap_or(body);
        if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
            return Err(DecodeError::new(
                ErrorElem::Int,
                body_start,
                format!("invalid integer body '{}'", body.escape_ascii()),
            ));
        }
        if magnitude.len() > 1 && magnitude[0] == b'0' {
            return Err(DecodeError::new(
                ErrorElem::Int,
                body_start,
                "invalid integer, cannot have an integer prefixed with 0",
            ));
        }
        if body == b"-0" {
            return Err(DecodeError::new(
                ErrorElem::Int,
                body_start,
                "invalid integer, negative zero",
            ));
        }
        // body is ascii digits with an optional sign, so it is valid utf-8
        let parsed = std::str::from_utf8(body)
            .ok()
            .and_then(|b| b.parse::<i64>().ok())
            .ok_or_else(|| {
                DecodeError::new(ErrorElem::Int, body_start, "integer does not fit 64 bits")
            })?;
        Ok((Value::Int(parsed), body_end + 1))
    }

    fn parse_list(source: &[u8], start: usize, depth: usize) -> Result<(Self, usize), DecodeError> {
        if depth >= MAX_DEPTH {
            return Err(DecodeError::new(
                ErrorElem::List,
                start,
                format!("containers nested deeper than {MAX_DEPTH} levels"),
            ));
        }
        let mut l = Vec::new();
        let mut index = start + 1;
        loop {
            match source.get(index) {
                None => {
                    return Err(DecodeError::new(
                        ErrorElem::List,
                        index,
                        "list not terminated",
                    ))
                }
                Some(b'e') => return Ok((Value::List(l), index + 1)),
                Some(_) => match Self::decode_at(source, index, depth + 1) {
                    Ok((v, next)) => {
                        l.push(v);
                        index = next;
                    }
                    Err(e) => {
                        return Err(DecodeError::wrap(
                            ErrorElem::List,
                            index,
                            format!("failed to decode list item {}", l.len()),
                            e,
                        ))
                    }
                },
            }
        }
    }

    fn parse_dict(source: &[u8], start: usize, depth: usize) -> Result<(Self, usize), DecodeError> {
        if depth >= MAX_DEPTH {
            return Err(DecodeError::new(
                ErrorElem::Dict,
                start,
                format!("containers nested deeper than {MAX_DEPTH} levels"),
            ));
        }
        let mut d = BTreeMap::new();
        let mut index = start + 1;
        loop {
            match source.get(index) {
                None => {
                    return Err(DecodeError::new(
                        ErrorElem::Dict,
                        index,
                        "dictionary not terminated",
                    ))
                }
                Some(b'e') => return Ok((Value::Dict(d), index + 1)),
                Some(b'0'..=b'9') => {
                    let (key, next) = match Self::parse_str(source, index) {
                        Ok((Value::Str(k), next)) => (k, next),
                        Ok(_) => unreachable!("parse_str only returns strings"),
                        Err(e) => {
                            return Err(DecodeError::wrap(
                                ErrorElem::Dict,
                                index,
                                "failed to decode dictionary key",
                                e,
                            ))
                        }
                    };
                    let (v, next) = Self::decode_at(source, next, depth + 1).map_err(|e| {
                        DecodeError::wrap(
                            ErrorElem::Dict,
                            next,
                            format!("failed to decode value for key \"{}\"", force_string(&key)),
                            e,
                        )
                    })?;
                    d.insert(key, v);
                    index = next;
                }
                Some(c) => {
                    return Err(DecodeError::new(
                        ErrorElem::Dict,
                        index,
                        format!(
                            "expected a byte string key, found token '{}'",
                            c.escape_ascii()
                        ),
                    ))
                }
            }
        }
    }
}

fn encode_string(s: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(s.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(s);
}
