//! Typed extraction of named call parameters. Every failure here is `InvalidRequest`.
use crate::{account::Account, errors::VaultError, registry::TokenKind};
use serde_json::Value;

fn invalid(msg: impl Into<String>) -> VaultError {
    VaultError::InvalidRequest(msg.into())
}

pub fn ensure_object(params: &Value) -> Result<(), VaultError> {
    match params {
        Value::Null | Value::Object(_) => Ok(()),
        Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Array(_) => {
            Err(invalid("params must be an object"))
        }
    }
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>, VaultError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(invalid(format!("{key} must be a string"))),
    }
}

pub fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, VaultError> {
    optional_str(params, key)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(format!("missing {key}")))
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, VaultError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(invalid(format!("{key} must be a boolean"))),
    }
}

pub fn optional_u8(params: &Value, key: &str) -> Result<Option<u8>, VaultError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(format!("{key} must be an integer in 0..=255"))),
    }
}

pub fn required_kind(params: &Value) -> Result<TokenKind, VaultError> {
    TokenKind::parse(required_str(params, "tokenKind")?)
}

pub fn optional_kind(params: &Value) -> Result<Option<TokenKind>, VaultError> {
    optional_str(params, "tokenKind")?
        .map(TokenKind::parse)
        .transpose()
}

/// ERC-721 ids are uint256, so hosts send them either as decimal strings or plain numbers.
pub fn optional_token_id(params: &Value) -> Result<Option<String>, VaultError> {
    match params.get("tokenId") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) if n.is_u64() => Ok(Some(n.to_string())),
        Some(_) => Err(invalid(
            "tokenId must be a string or a non-negative integer",
        )),
    }
}

fn parse_chain_id(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let t = s.trim();
            t.strip_prefix("0x")
                .or_else(|| t.strip_prefix("0X"))
                .map_or_else(|| t.parse().ok(), |h| u64::from_str_radix(h, 16).ok())
        }
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

/// The host's `context` for this call, if it sent one.
pub fn context_account(params: &Value) -> Result<Option<Account>, VaultError> {
    let Some(ctx) = params.get("context").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    if !ctx.is_object() {
        return Err(invalid("context must be an object"));
    }
    let address = required_str(ctx, "address")?;
    let chain_id = ctx
        .get("chainId")
        .and_then(parse_chain_id)
        .ok_or_else(|| invalid("context.chainId must be an unsigned integer"))?;
    Ok(Some(Account::new(address, chain_id)?))
}
