/*! Typed argument values and their byte-exact wire encoding.

Values are ASCII-safe on the wire except for raw bytes inside blob escapes.
Scalars are bare tokens (`123`, `1.5`, `T`, `F`, `N`), text is quoted with a
small escape map, blobs are `0"…"`, lists are `[a,b]`, and dictionaries are
`{key=value,…}` with keys in ascending byte order. Re-encoding a decoded
value reproduces the original bytes, which the frame checkbytes depend on.
*/
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Significant figures used when encoding floats. Part of the wire
/// contract: peers checksum the exact bytes.
pub const FLOAT_SIG_FIGS: usize = 6;

/// Dictionary payload type.
pub type Dict = BTreeMap<String, Value>;

/// How to treat bare (unquoted) tokens that are not numbers or `T`/`F`/`N`.
///
/// Older firmware emits unquoted strings; decoding them is a compatibility
/// path. New encoders never produce them, and the strict default rejects
/// them as a parse error.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParseMode {
    /// Reject bare string tokens.
    #[default]
    Strict,
    /// Accept bare string tokens as [`Value::Str`].
    Permissive,
}

/// A single typed argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Signed integer, decimal ASCII on the wire.
    Int(i64),
    /// Double-precision float, 6 significant figures on the wire.
    Float(f64),
    /// `T` or `F` on the wire.
    Bool(bool),
    /// `N` on the wire.
    Null,
    /// UTF-8 text, quoted and escaped.
    Str(String),
    /// Arbitrary bytes, `0"…"` with the same escapes.
    Blob(Vec<u8>),
    /// Ordered sequence.
    List(Vec<Value>),
    /// Key/value mapping; keys are `[A-Za-z0-9_]+` and unique.
    Dict(Dict),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.into())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
impl From<Dict> for Value {
    fn from(v: Dict) -> Self {
        Value::Dict(v)
    }
}

impl Value {
    /// Blob constructor, since `From<Vec<u8>>` would be ambiguous with
    /// lists at a glance.
    pub fn blob(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Blob(bytes.into())
    }

    /// Integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
    /// Float payload, if this is a float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
    /// Bool payload, if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
    /// String payload, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
    /// Byte payload, if this is a blob.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }
    /// List payload, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }
    /// Dictionary payload, if this is a dict.
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Validate that this value (recursively) is encodable: every
    /// dictionary key is non-empty `[A-Za-z0-9_]+`.
    pub fn check(&self) -> Result<()> {
        match self {
            Value::List(items) => items.iter().try_for_each(Value::check),
            Value::Dict(map) => {
                for (k, v) in map {
                    if !is_valid_dict_key(k) {
                        return Err(Error::Config(format!("bad dict key: {k:?}")));
                    }
                    v.check()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Append the wire encoding of this value to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
            Value::Float(v) => out.extend_from_slice(format_float(*v).as_bytes()),
            Value::Bool(true) => out.push(b'T'),
            Value::Bool(false) => out.push(b'F'),
            Value::Null => out.push(b'N'),
            Value::Str(s) => escape_into(s.as_bytes(), out),
            Value::Blob(b) => {
                out.push(b'0');
                escape_into(b, out);
            }
            Value::List(items) => {
                out.push(b'[');
                for (n, item) in items.iter().enumerate() {
                    if n > 0 {
                        out.push(b',');
                    }
                    item.encode_into(out);
                }
                out.push(b']');
            }
            Value::Dict(map) => {
                // BTreeMap iteration is already in ascending key order.
                out.push(b'{');
                for (n, (k, v)) in map.iter().enumerate() {
                    if n > 0 {
                        out.push(b',');
                    }
                    out.extend_from_slice(k.as_bytes());
                    out.push(b'=');
                    v.encode_into(out);
                }
                out.push(b'}');
            }
        }
    }

    /// The wire encoding of this value alone.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.encode()))
    }
}

/// True if `key` is a legal dictionary key: non-empty `[A-Za-z0-9_]+`.
pub fn is_valid_dict_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(is_key_byte)
}

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    out.push(b'"');
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'"' => out.extend_from_slice(b"\\\""),
            b'<' => out.extend_from_slice(b"\\("),
            b'>' => out.extend_from_slice(b"\\)"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0 => out.extend_from_slice(b"\\0"),
            b => out.push(b),
        }
    }
    out.push(b'"');
}

/// Format a float like C's `%.6g`: [`FLOAT_SIG_FIGS`] significant figures,
/// trailing zeros stripped, exponent notation outside `1e-4..1e6`, and a
/// signed two-digit exponent.
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x < 0.0 { "-inf" } else { "inf" }.into();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0" } else { "0" }.into();
    }
    let exp_form = format!("{:.*e}", FLOAT_SIG_FIGS - 1, x.abs());
    let (mant, exp) = exp_form.split_once('e').expect("exponent notation");
    let exp: i32 = exp.parse().expect("exponent digits");
    let digits: String = mant.chars().filter(|c| *c != '.').collect();

    let mut s = String::new();
    if x < 0.0 {
        s.push('-');
    }
    if exp < -4 || exp >= FLOAT_SIG_FIGS as i32 {
        let trimmed = digits.trim_end_matches('0');
        s.push_str(&trimmed[..1]);
        if trimmed.len() > 1 {
            s.push('.');
            s.push_str(&trimmed[1..]);
        }
        s.push('e');
        s.push(if exp < 0 { '-' } else { '+' });
        let e = exp.unsigned_abs();
        if e < 10 {
            s.push('0');
        }
        s.push_str(&e.to_string());
    } else if exp >= 0 {
        let split = exp as usize + 1;
        s.push_str(&digits[..split]);
        let frac = digits[split..].trim_end_matches('0');
        if !frac.is_empty() {
            s.push('.');
            s.push_str(frac);
        }
    } else {
        s.push_str("0.");
        for _ in 0..(-exp - 1) {
            s.push('0');
        }
        s.push_str(digits.trim_end_matches('0'));
    }
    s
}

/// Parse a comma-separated argument sequence, requiring every byte to be
/// consumed. The empty input is the empty sequence.
pub fn parse_args(buf: &[u8], mode: ParseMode) -> Result<Vec<Value>> {
    // Wrapping in a synthetic list reuses the list grammar, including its
    // separator rules. Early termination means a surplus close bracket.
    let mut wrapped = Vec::with_capacity(buf.len() + 2);
    wrapped.push(b'[');
    wrapped.extend_from_slice(buf);
    wrapped.push(b']');
    let (v, consumed) = parse_list(&wrapped, mode)?;
    if consumed < wrapped.len() {
        return Err(Error::Parse(format!(
            "extra close bracket in args: {:?}",
            String::from_utf8_lossy(buf)
        )));
    }
    match v {
        Value::List(items) => Ok(items),
        _ => unreachable!("parse_list returns a list"),
    }
}

/// Parse a single value from the start of `buf`. Returns the value and the
/// number of bytes consumed; callers handle any remainder.
pub fn parse_value(buf: &[u8], mode: ParseMode) -> Result<(Value, usize)> {
    match buf.first() {
        None => Err(Error::Parse("missing item".into())),
        Some(b'[') => parse_list(buf, mode),
        Some(b'{') => parse_dict(buf, mode),
        _ => parse_item(buf, mode),
    }
}

fn parse_list(buf: &[u8], mode: ParseMode) -> Result<(Value, usize)> {
    debug_assert_eq!(buf[0], b'[');
    let mut items = Vec::new();
    let mut offset = 1;
    while offset < buf.len() {
        if buf[offset] == b']' {
            return Ok((Value::List(items), offset + 1));
        }
        if !items.is_empty() {
            if buf[offset] != b',' {
                return Err(Error::Parse("missing separator in list".into()));
            }
            offset += 1;
        }
        let (v, n) = parse_value(&buf[offset..], mode)?;
        offset += n;
        items.push(v);
    }
    Err(Error::Parse("list never ended".into()))
}

fn parse_dict(buf: &[u8], mode: ParseMode) -> Result<(Value, usize)> {
    debug_assert_eq!(buf[0], b'{');
    let mut map = Dict::new();
    let mut offset = 1;
    while offset < buf.len() {
        if buf[offset] == b'}' {
            return Ok((Value::Dict(map), offset + 1));
        }
        if !map.is_empty() {
            if buf[offset] != b',' {
                return Err(Error::Parse("missing separator in dict".into()));
            }
            offset += 1;
        }
        let key_start = offset;
        while offset < buf.len() && is_key_byte(buf[offset]) {
            offset += 1;
        }
        if offset == key_start {
            return Err(Error::Parse("invalid dict key".into()));
        }
        if offset == buf.len() || buf[offset] != b'=' {
            return Err(Error::Parse("dict key without value".into()));
        }
        // Key bytes are a subset of ASCII, so this cannot fail.
        let key = String::from_utf8_lossy(&buf[key_start..offset]).into_owned();
        offset += 1;
        let (v, n) = parse_value(&buf[offset..], mode)?;
        offset += n;
        if map.insert(key.clone(), v).is_some() {
            return Err(Error::Parse(format!("duplicate dict key: {key:?}")));
        }
    }
    Err(Error::Parse("dict never ended".into()))
}

/// Quoted strings/blobs and bare scalar tokens.
fn parse_item(buf: &[u8], mode: ParseMode) -> Result<(Value, usize)> {
    if buf.first() == Some(&b'"') {
        let (bytes, n) = decode_quoted(buf)?;
        let s = String::from_utf8(bytes)
            .map_err(|_| Error::Parse("string was not valid UTF-8".into()))?;
        return Ok((Value::Str(s), n));
    }
    if buf.len() >= 2 && buf[0] == b'0' && buf[1] == b'"' {
        let (bytes, n) = decode_quoted(&buf[1..])?;
        return Ok((Value::Blob(bytes), n + 1));
    }
    let mut end = 0;
    while end < buf.len() && !matches!(buf[end], b',' | b']' | b'}') {
        end += 1;
    }
    if end == 0 {
        return Err(Error::Parse("missing or empty item".into()));
    }
    let token = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::Parse("non-ASCII bytes outside string".into()))?;
    Ok((parse_scalar(token, mode)?, end))
}

/// Interpret a bare token: integer first, then float, then `T`/`F`/`N`,
/// then (permissively) a string.
fn parse_scalar(token: &str, mode: ParseMode) -> Result<Value> {
    if let Ok(v) = token.parse::<i64>() {
        return Ok(Value::Int(v));
    }
    if let Ok(v) = token.parse::<f64>() {
        return Ok(Value::Float(v));
    }
    match token {
        "T" => Ok(Value::Bool(true)),
        "F" => Ok(Value::Bool(false)),
        "N" => Ok(Value::Null),
        _ if mode == ParseMode::Permissive => Ok(Value::Str(token.into())),
        _ => Err(Error::Parse(format!("cannot parse item: {token:?}"))),
    }
}

/// Decode a `"…"` escape sequence starting at the opening quote. Returns
/// the raw bytes and the count consumed, including both quotes.
fn decode_quoted(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    debug_assert_eq!(buf[0], b'"');
    let mut out = Vec::new();
    let mut escaped = false;
    for (i, &b) in buf.iter().enumerate().skip(1) {
        if escaped {
            out.push(match b {
                b'\\' => b'\\',
                b'"' => b'"',
                b'(' => b'<',
                b')' => b'>',
                b'n' => b'\n',
                b'r' => b'\r',
                b'0' => 0,
                other => {
                    return Err(Error::Parse(format!(
                        "invalid escaped character {:?}",
                        other as char
                    )));
                }
            });
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return Ok((out, i + 1));
        } else {
            out.push(b);
        }
    }
    Err(Error::Parse("string never ended".into()))
}
