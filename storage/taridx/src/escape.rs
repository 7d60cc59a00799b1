//! Record-field escaping.
//!
//! Member names may contain commas and backslashes, the two characters
//! the record grammar gives meaning to. The same escape pair is used by
//! the tail log and the node serializer, so both sides must round-trip
//! through this module and nothing else.

use std::borrow::Cow;

/// Escape `,` and `\` with a leading backslash.
pub(crate) fn escape(name: &str) -> Cow<'_, str> {
    if !name.contains([',', '\\']) {
        return Cow::Borrowed(name);
    }
    let mut out = String::with_capacity(name.len() + 2);
    for c in name.chars() {
        if c == ',' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    Cow::Owned(out)
}

/// Split a row on unescaped commas, removing one level of escaping.
///
/// A backslash takes the following character verbatim; a lone trailing
/// backslash is kept as a literal. Always yields at least one field.
pub(crate) fn split_fields(row: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = row.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => field.push(escaped),
                None => field.push('\\'),
            },
            ',' => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}
