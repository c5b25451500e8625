//! `ODataQueryOptions` and URL parsing/building (spec §3 "ODataQueryOptions",
//! §4.E "URL building").

/// The five recognised OData system query options this compiler folds into.
/// Mirrors `SqlState` in spirit: a rolling, immutable-by-replacement state
/// carried from step to step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ODataQueryOptions {
    pub select: Option<Vec<String>>,
    pub filter: Option<String>,
    pub orderby: Option<String>,
    pub skip: Option<i64>,
    pub top: Option<i64>,
}

/// A parsed OData source URL: the base (scheme/host/path, no query string),
/// the recognised options seeded from the URL's own query string, and any
/// query parameters this compiler doesn't recognise, preserved verbatim so
/// they survive a round trip through `build_url`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUrl {
    pub base: String,
    pub options: ODataQueryOptions,
    pub extra_params: Vec<(String, String)>,
}

const RECOGNISED_KEYS: &[&str] = &["$select", "$filter", "$orderby", "$skip", "$top"];

/// Parses `url`, case-insensitively recognising the five OData system query
/// options and preserving everything else unchanged.
pub fn parse_url(url: &str) -> ParsedUrl {
    let Some((base, query)) = url.split_once('?') else {
        return ParsedUrl {
            base: url.to_string(),
            options: ODataQueryOptions::default(),
            extra_params: Vec::new(),
        };
    };

    let mut options = ODataQueryOptions::default();
    let mut extra_params = Vec::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key_decoded = percent_decode(key);
        let value_decoded = percent_decode(value);
        let lower = key_decoded.to_ascii_lowercase();
        match RECOGNISED_KEYS.iter().find(|k| **k == lower) {
            Some(&"$select") => {
                options.select = Some(value_decoded.split(',').map(str::to_string).collect());
            }
            Some(&"$filter") => options.filter = Some(value_decoded),
            Some(&"$orderby") => options.orderby = Some(value_decoded),
            Some(&"$skip") => options.skip = value_decoded.parse().ok(),
            Some(&"$top") => options.top = value_decoded.parse().ok(),
            _ => extra_params.push((key_decoded, value_decoded)),
        }
    }

    ParsedUrl {
        base: base.to_string(),
        options,
        extra_params,
    }
}

/// Rebuilds a URL from `base`, the current recognised options, and any
/// preserved unknown parameters. Values are percent-encoded, preserving `,`
/// for readability; parameter names preserve their leading `$`.
pub fn build_url(base: &str, options: &ODataQueryOptions, extra_params: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(select) = &options.select {
        if !select.is_empty() {
            pairs.push(("$select".to_string(), select.join(",")));
        }
    }
    if let Some(filter) = &options.filter {
        pairs.push(("$filter".to_string(), filter.clone()));
    }
    if let Some(orderby) = &options.orderby {
        pairs.push(("$orderby".to_string(), orderby.clone()));
    }
    if let Some(skip) = options.skip {
        pairs.push(("$skip".to_string(), skip.to_string()));
    }
    if let Some(top) = options.top {
        pairs.push(("$top".to_string(), top.to_string()));
    }
    for (k, v) in extra_params {
        pairs.push((k.clone(), v.clone()));
    }

    if pairs.is_empty() {
        return base.to_string();
    }

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode_name(k), percent_encode_value(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

/// Percent-encodes a query parameter name, preserving `$` (OData system
/// options are conventionally spelled with it) alongside the usual unreserved
/// set.
fn percent_encode_name(s: &str) -> String {
    percent_encode(s, |b| is_unreserved(b) || b == b'$')
}

/// Percent-encodes a query parameter value, preserving `,` for readability
/// (OData `$select`/`$orderby` lists read far better unencoded).
fn percent_encode_value(s: &str) -> String {
    percent_encode(s, |b| is_unreserved(b) || b == b',')
}

fn percent_encode(s: &str, keep: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.as_bytes() {
        if keep(*b) {
            out.push(*b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        if bytes[i] == b'+' {
            out.push(b' ');
        } else {
            out.push(bytes[i]);
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
