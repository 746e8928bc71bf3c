//! Distinguished-name helpers shared by the planner, the scope rules and the
//! LDAP store.

/// Splits a DN at its first unescaped comma into (first RDN, parent DN).
pub fn split_dn(dn: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            ',' => return (dn[..i].trim(), dn[i + 1..].trim_start()),
            _ => {}
        }
    }
    (dn.trim(), "")
}

fn rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = dn;
    while !rest.is_empty() {
        let (rdn, parent) = split_dn(rest);
        parts.push(rdn);
        rest = parent;
    }
    parts
}

/// Escapes a value for use inside an RDN.
pub fn escape_rdn_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let leading = i == 0 && (c == '#' || c == ' ');
        if leading || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    if escaped.ends_with(' ') && !escaped.ends_with("\\ ") {
        escaped.pop();
        escaped.push_str("\\ ");
    }
    escaped
}

/// Decodes `\,` and `\2C` style escapes.
pub fn unescape_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let hex = value
                .get(i + 1..i + 3)
                .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(byte) => {
                    out.push(byte);
                    i += 3;
                }
                None => {
                    out.push(bytes[i + 1]);
                    i += 2;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Unescaped value of a DN's first RDN: `Jane Doe` for `CN=Jane Doe,OU=...`.
pub fn first_rdn_value(dn: &str) -> Option<String> {
    let (rdn, _) = split_dn(dn);
    rdn.split_once('=')
        .map(|(_, value)| unescape_value(value).trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Canonical form for comparing DNs, org unit paths and group emails.
///
/// DNs are compared RDN by RDN with escapes decoded and re-encoded one way,
/// so `OU=Smith\, Jones` and `ou=smith\2C jones` are equal. Values without an
/// `=` are only trimmed and lowercased.
pub fn normalize(value: &str) -> String {
    let value = value.trim();
    if !value.contains('=') {
        return value.to_lowercase();
    }
    rdns(value)
        .into_iter()
        .map(|rdn| match rdn.split_once('=') {
            Some((attribute, raw)) => format!(
                "{}={}",
                attribute.trim().to_lowercase(),
                escape_rdn_value(unescape_value(raw).trim()).to_lowercase()
            ),
            None => rdn.trim().to_lowercase(),
        })
        .collect::<Vec<_>>()
        .join(",")
}
