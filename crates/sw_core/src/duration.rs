//! 时长字符串解析 (`"5s"`, `"1m30s"`, `"250ms"`)

use std::time::Duration;

use crate::error::{Result, StepWeaveError};

/// 解析时长字符串
///
/// 支持单位 `ms`、`s`、`m`、`h`、`d`，可组合 (如 `1h30m`)。
pub fn parse_duration(input: &str) -> Result<Duration> {
    let text = input.trim();
    if text.is_empty() {
        return Err(StepWeaveError::Validation("empty duration".into()));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;

    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(invalid(input));
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid(input))?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3_600),
            "d" => Duration::from_secs(amount * 86_400),
            _ => return Err(invalid(input)),
        };
        total += part;
    }

    Ok(total)
}

fn invalid(input: &str) -> StepWeaveError {
    StepWeaveError::Validation(format!("invalid duration: {input:?}"))
}
