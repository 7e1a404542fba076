//! Parse-or-fallback for model output.
//!
//! Every stage that consumes model text goes through [`decode_json`] or
//! [`decode_text`]. Neither ever fails: a collaborator error, an empty reply or
//! non-conforming JSON all yield [`Decoded::FallbackUsed`] with the reason.

use askpipe_core::{Error, Result};
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Parsed(T),
    FallbackUsed { value: T, reason: String },
}

impl<T> Decoded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Decoded::Parsed(v) | Decoded::FallbackUsed { value: v, .. } => v,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Decoded::Parsed(v) | Decoded::FallbackUsed { value: v, .. } => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Decoded::FallbackUsed { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Decoded::Parsed(_) => None,
            Decoded::FallbackUsed { reason, .. } => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Parsed(v) => Decoded::Parsed(f(v)),
            Decoded::FallbackUsed { value, reason } => Decoded::FallbackUsed {
                value: f(value),
                reason,
            },
        }
    }
}

/// Remove a surrounding markdown code fence (```` ```json ... ``` ````), if any.
pub fn strip_fences(s: &str) -> &str {
    let t = s.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    // Drop the info string ("json", "JSON", ...) on the opening line.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// The outermost `{...}` span, for replies that wrap JSON in prose.
pub fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let body = strip_fences(raw);
    match serde_json::from_str::<T>(body) {
        Ok(v) => Ok(v),
        Err(first) => extract_json_object(body)
            .and_then(|inner| serde_json::from_str::<T>(inner).ok())
            .ok_or_else(|| Error::Malformed(first.to_string())),
    }
}

/// Decode a JSON reply, using `fallback` when the call failed or the reply does not conform.
pub fn decode_json<T, F>(reply: Result<String>, fallback: F) -> Decoded<T>
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    match reply.and_then(|raw| parse_json::<T>(&raw)) {
        Ok(v) => Decoded::Parsed(v),
        Err(e) => Decoded::FallbackUsed {
            value: fallback(),
            reason: e.to_string(),
        },
    }
}

/// Decode a free-text reply. Blank text counts as malformed.
pub fn decode_text<F>(reply: Result<String>, fallback: F) -> Decoded<String>
where
    F: FnOnce() -> String,
{
    let checked = reply.and_then(|raw| {
        let t = strip_fences(&raw).to_string();
        if t.is_empty() {
            Err(Error::Malformed("empty reply".to_string()))
        } else {
            Ok(t)
        }
    });
    match checked {
        Ok(v) => Decoded::Parsed(v),
        Err(e) => Decoded::FallbackUsed {
            value: fallback(),
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct V {
        a: u32,
    }

    #[test]
    fn strip_fences_handles_info_strings_and_plain_text() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn parse_json_digs_object_out_of_prose() {
        let v: V = parse_json("Sure! Here it is: {\"a\": 7} hope that helps").unwrap();
        assert_eq!(v, V { a: 7 });
        assert!(matches!(parse_json::<V>("no json"), Err(Error::Malformed(_))));
    }

    #[test]
    fn decode_json_reports_fallback_reason() {
        let d = decode_json::<V, _>(Ok("{\"b\":1}".to_string()), || V { a: 0 });
        assert!(d.is_fallback());
        assert!(d.fallback_reason().unwrap().contains("malformed"));

        let d = decode_json::<V, _>(Err(Error::Llm("down".to_string())), || V { a: 9 });
        assert_eq!(d.fallback_reason(), Some("llm failed: down"));
        assert_eq!(d.into_inner(), V { a: 9 });

        let d = decode_json::<V, _>(Ok("```json\n{\"a\":3}\n```".to_string()), || V { a: 0 });
        assert_eq!(d, Decoded::Parsed(V { a: 3 }));
    }

    #[test]
    fn decode_text_treats_blank_as_malformed() {
        let d = decode_text(Ok("   ".to_string()), || "fb".to_string());
        assert!(d.is_fallback());
        assert_eq!(d.value(), "fb");
        assert_eq!(
            decode_text(Ok(" hi ".to_string()), String::new).into_inner(),
            "hi"
        );
    }

    proptest! {
        #[test]
        fn decode_json_never_panics(raw in any::<String>()) {
            let d = decode_json::<V, _>(Ok(raw), || V { a: 42 });
            if d.is_fallback() {
                prop_assert_eq!(d.into_inner(), V { a: 42 });
            }
        }
    }
}
