//! Parser for the `ARCAN_ARG`-style packed argument blob: `k1=v1:k2:k3=v3`.
//!
//! The tab character is the only escape: a literal `\t` inside a field
//! decodes to `:`. A second `=` within one `:`-delimited field before the
//! first is resolved is a syntax error and fails the whole parse, matching
//! `arg_unpack` in the original source.

use crate::error::{Error, Result};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Arg {
    pub key: String,
    pub value: Option<String>,
}

fn unescape(field: &str) -> String {
    field.replace('\t', ":")
}

fn escape(field: &str) -> String {
    field.replace(':', "\t")
}

/// Parse a packed argument string into an ordered list of key/value pairs.
pub fn unpack(resource: &str) -> Result<Vec<Arg>> {
    let mut out = Vec::new();

    for (field_start, field) in split_offsets(resource) {
        let mut key = None;
        let mut value = None;
        let mut seen_eq = false;

        // Scan for the first unescaped '='; a second one is a syntax error.
        let mut eq_at = None;
        for (i, c) in field.char_indices() {
            if c == '=' {
                if seen_eq {
                    return Err(Error::Argument {
                        offset: field_start + i,
                    });
                }
                seen_eq = true;
                eq_at = Some(i);
            }
        }

        match eq_at {
            Some(i) => {
                key = Some(unescape(&field[..i]));
                value = Some(unescape(&field[i + 1..]));
            }
            None => {
                key = Some(unescape(field));
            }
        }

        out.push(Arg {
            key: key.unwrap(),
            value,
        });
    }

    Ok(out)
}

/// Split on ':', tracking the byte offset each field started at (for error
/// reporting) without splitting inside tab-escaped colons... there are none,
/// since `\t` is the escape and never a literal `:`, so a plain split is
/// exact.
fn split_offsets(resource: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    resource.split(':').map(move |field| {
        let start = offset;
        offset += field.len() + 1;
        (start, field)
    })
}

/// Re-serialize into the packed wire form, the inverse of [`unpack`].
pub fn pack(args: &[Arg]) -> String {
    args.iter()
        .map(|a| match &a.value {
            Some(v) => format!("{}={}", escape(&a.key), escape(v)),
            None => escape(&a.key),
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Look up the `ind`th occurrence (0-based) of `key`.
pub fn lookup<'a>(args: &'a [Arg], key: &str, ind: usize) -> Option<&'a Option<String>> {
    args.iter()
        .filter(|a| a.key == key)
        .nth(ind)
        .map(|a| &a.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_keys_and_pairs() {
        let parsed = unpack("k1=v1:k2:k3=v3").unwrap();
        assert_eq!(
            parsed,
            vec![
                Arg { key: "k1".into(), value: Some("v1".into()) },
                Arg { key: "k2".into(), value: None },
                Arg { key: "k3".into(), value: Some("v3".into()) },
            ]
        );
    }

    #[test]
    fn tab_escapes_colon() {
        let parsed = unpack("msg=hello\tworld:k2").unwrap();
        assert_eq!(parsed[0].value.as_deref(), Some("hello:world"));
    }

    #[test]
    fn second_equals_in_a_field_is_an_error() {
        assert!(unpack("k1=v1=v2").is_err());
    }

    #[test]
    fn round_trip_is_idempotent() {
        let input = "k1=v1:k2:k3=v3";
        let parsed = unpack(input).unwrap();
        let repacked = pack(&parsed);
        let reparsed = unpack(&repacked).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn lookup_returns_nth_match() {
        let parsed = unpack("a=1:a=2:a=3").unwrap();
        assert_eq!(lookup(&parsed, "a", 1).unwrap().as_deref(), Some("2"));
    }
}
