use crate::address::parse_address_literal;
use crate::dispatch::CommandError;
use crate::provider::IntrospectionProvider;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::str::FromStr;

/// Typed view over the `params` object of a request.
///
/// A `null` parameter is treated the same way as a missing one.
pub struct Params<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|v| !v.is_null())
    }

    fn invalid(name: &'static str, reason: impl Display) -> CommandError {
        CommandError::InvalidParam {
            name,
            reason: reason.to_string(),
        }
    }

    pub fn opt_str(&self, name: &'static str) -> Result<Option<&'a str>, CommandError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(Self::invalid(name, format!("expected string, got {other}"))),
        }
    }

    pub fn str(&self, name: &'static str) -> Result<&'a str, CommandError> {
        self.opt_str(name)?.ok_or(CommandError::MissingParam(name))
    }

    /// Value rendered as text, numbers are accepted in place of strings.
    pub fn text(&self, name: &'static str) -> Result<String, CommandError> {
        match self.get(name) {
            None => Err(CommandError::MissingParam(name)),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(other) => Err(Self::invalid(name, format!("expected string or number, got {other}"))),
        }
    }

    pub fn usize_or(&self, name: &'static str, default: usize) -> Result<usize, CommandError> {
        match self.get(name) {
            None => Ok(default),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|v| v as usize)
                .ok_or_else(|| Self::invalid(name, "expected non-negative integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| Self::invalid(name, "expected non-negative integer")),
            Some(other) => Err(Self::invalid(name, format!("expected integer, got {other}"))),
        }
    }

    pub fn bool_or(&self, name: &'static str, default: bool) -> Result<bool, CommandError> {
        match self.get(name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(Self::invalid(name, format!("expected boolean, got {other}"))),
        }
    }

    /// Parse a textual enumeration parameter (value types, access modes, ...).
    pub fn parse_or<T>(&self, name: &'static str, default: T) -> Result<T, CommandError>
    where
        T: FromStr,
    {
        match self.opt_str(name)? {
            None => Ok(default),
            Some(s) => T::from_str(&s.to_ascii_lowercase())
                .map_err(|_| Self::invalid(name, format!("unknown value `{s}`"))),
        }
    }

    /// Signed offsets, given as integers or hex strings (`"0x10"`, `"-0x8"`).
    pub fn offsets_or(&self, name: &'static str, default: &[i64]) -> Result<Vec<i64>, CommandError> {
        let Some(value) = self.get(name) else {
            return Ok(default.to_vec());
        };
        let Value::Array(items) = value else {
            return Err(Self::invalid(name, "expected array of offsets"));
        };

        items
            .iter()
            .map(|item| match item {
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| Self::invalid(name, format!("offset {n} out of range"))),
                Value::String(s) => {
                    let (negative, digits) = match s.trim().strip_prefix('-') {
                        Some(rest) => (true, rest),
                        None => (false, s.trim()),
                    };
                    let v = parse_address_literal(digits)
                        .ok_or_else(|| Self::invalid(name, format!("invalid offset `{s}`")))?
                        as i64;
                    Ok(if negative { -v } else { v })
                }
                other => Err(Self::invalid(name, format!("invalid offset {other}"))),
            })
            .collect()
    }

    pub fn opt_address(
        &self,
        name: &'static str,
        provider: &dyn IntrospectionProvider,
    ) -> Result<Option<u64>, CommandError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| Self::invalid(name, format!("invalid address {n}"))),
            Some(Value::String(s)) => resolve_address(s, provider)
                .map(Some)
                .map_err(|reason| Self::invalid(name, reason)),
            Some(other) => Err(Self::invalid(name, format!("invalid address {other}"))),
        }
    }

    pub fn address(
        &self,
        name: &'static str,
        provider: &dyn IntrospectionProvider,
    ) -> Result<u64, CommandError> {
        self.opt_address(name, provider)?
            .ok_or(CommandError::MissingParam(name))
    }
}

/// Resolve an address expression: a hex literal, a symbol or module name, or `base+offset`
/// where `base` is itself an expression and `offset` a hex literal.
///
/// `0x`-prefixed literals are taken as is. A bare token is looked up as a symbol first and
/// read as hex only when no such symbol exists, so names like `add` or `cafe` stay reachable.
pub fn resolve_address(expr: &str, provider: &dyn IntrospectionProvider) -> Result<u64, String> {
    let expr = expr.trim();
    if expr.starts_with("0x") || expr.starts_with("0X") {
        return parse_address_literal(expr).ok_or_else(|| format!("invalid address `{expr}`"));
    }

    if let Some((base, offset)) = expr.rsplit_once('+') {
        let offset = parse_address_literal(offset)
            .ok_or_else(|| format!("invalid offset `{}` in `{expr}`", offset.trim()))?;
        return Ok(resolve_address(base, provider)?.wrapping_add(offset));
    }

    match provider.resolve_symbol(expr) {
        Ok(address) => Ok(address),
        Err(e) => parse_address_literal(expr).ok_or_else(|| e.to_string()),
    }
}
