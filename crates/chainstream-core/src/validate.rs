//! Subscription argument validation.
//!
//! Checks run in a fixed order and stop at the first failure, so a client
//! always receives the most fundamental problem with its request.

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::types::Subscription;

/// Validate a raw `transactions_history` payload and build a [`Subscription`].
pub fn validate_subscription(payload: &Value) -> Result<Subscription, ValidationError> {
    let args = payload.as_object().ok_or(ValidationError::InvalidArguments)?;

    let accounts = parse_accounts(args).ok_or(ValidationError::InvalidAccounts)?;

    let start_block = match present(args, "start_block") {
        None => None,
        Some(v) => Some(parse_block_number(v).ok_or(ValidationError::InvalidStartBlock)?),
    };

    let irreversible = match present(args, "irreversible") {
        None => false,
        Some(v) => v.as_bool().ok_or(ValidationError::InvalidIrreversible)?,
    };

    if irreversible && start_block.is_none() {
        return Err(ValidationError::MissingStartBlock);
    }

    Ok(Subscription { accounts, start_block, irreversible })
}

/// A key that is missing or explicitly `null` counts as absent.
fn present<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    args.get(key).filter(|v| !v.is_null())
}

fn parse_accounts(args: &Map<String, Value>) -> Option<Vec<String>> {
    let raw = args.get("accounts")?.as_array()?;
    if raw.is_empty() {
        return None;
    }
    let mut accounts: Vec<String> = Vec::with_capacity(raw.len());
    for value in raw {
        let account = value.as_str().filter(|s| !s.is_empty())?;
        if !accounts.iter().any(|a| a == account) {
            accounts.push(account.to_string());
        }
    }
    Some(accounts)
}

fn parse_block_number(value: &Value) -> Option<u64> {
    let Value::Number(number) = value else {
        return None;
    };
    if let Some(n) = number.as_u64() {
        return Some(n);
    }
    let f = number.as_f64()?;
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then_some(f as u64)
}
