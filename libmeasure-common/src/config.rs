// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod parse_env {
    use std::{env, str::FromStr, time::Duration};

    pub fn duration(name: &str) -> Option<Duration> {
        Some(Duration::from_secs_f32(
            env::var(name).ok()?.parse::<f32>().ok()?,
        ))
    }

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.trim().parse::<T>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        match env::var(name).ok()?.as_str() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" | "yes" | "YES" | "on" | "ON" => Some(true),
            _ => Some(false),
        }
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }

    /// Reads a memory size such as `16000k`, `8K`, `64MB` or `1G`.
    pub fn bytes(name: &str) -> Option<u64> {
        super::parse_size(&str_not_empty(name)?)
    }
}

/// Parses a byte count with an optional binary unit suffix (`k`, `M`, `G`,
/// optionally followed by `b`/`B`). Returns `None` on overflow or garbage.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let text = text
        .strip_suffix('b')
        .or_else(|| text.strip_suffix('B'))
        .unwrap_or(text);
    let (digits, shift) = match text.as_bytes().last()? {
        b'k' | b'K' => (&text[..text.len() - 1], 10),
        b'm' | b'M' => (&text[..text.len() - 1], 20),
        b'g' | b'G' => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value = digits.trim().parse::<u64>().ok()?;
    value.checked_mul(1u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("8k"), Some(8192));
        assert_eq!(parse_size("16000K"), Some(16_384_000));
        assert_eq!(parse_size("2M"), Some(2 << 20));
        assert_eq!(parse_size("1GB"), Some(1 << 30));
        assert_eq!(parse_size(" 64 kb "), Some(64 << 10));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size("twelve"), None);
        assert_eq!(parse_size("18446744073709551615G"), None);
    }

    #[test]
    fn env_helpers() {
        env::set_var("LIBMEASURE_COMMON_TEST_INT", " 42");
        env::set_var("LIBMEASURE_COMMON_TEST_BOOL", "True");
        env::set_var("LIBMEASURE_COMMON_TEST_EMPTY", "");
        env::set_var("LIBMEASURE_COMMON_TEST_BYTES", "4k");

        assert_eq!(parse_env::int::<u32>("LIBMEASURE_COMMON_TEST_INT"), Some(42));
        assert_eq!(parse_env::bool("LIBMEASURE_COMMON_TEST_BOOL"), Some(true));
        assert_eq!(parse_env::str_not_empty("LIBMEASURE_COMMON_TEST_EMPTY"), None);
        assert_eq!(parse_env::bytes("LIBMEASURE_COMMON_TEST_BYTES"), Some(4096));
        assert_eq!(parse_env::int::<u32>("LIBMEASURE_COMMON_TEST_UNSET"), None);
    }
}
