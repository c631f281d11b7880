//! URL normalisation for deduplication keys
//!
//! Two requests pointing at the same resource should collapse to one
//! unit of work even when their URLs differ in query-parameter order,
//! fragment, or surrounding whitespace. The normalised form produced
//! here is the default unique key of a request.

use url::Url;

/// Normalise a URL string into the canonical form used as the default
/// deduplication key.
///
/// The scheme and host are lowercased by the parser, query parameters
/// are sorted by key then value, surrounding whitespace is trimmed, and
/// the fragment is dropped unless `keep_url_fragment` is set.
pub fn normalize_url(raw: &str, keep_url_fragment: bool) -> Result<String, url::ParseError> {
    let mut parsed = Url::parse(raw.trim())?;

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if pairs.is_empty() {
        // Drops a bare trailing '?' as well.
        parsed.set_query(None);
    } else {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    if !keep_url_fragment {
        parsed.set_fragment(None);
    }

    Ok(parsed.to_string())
}
